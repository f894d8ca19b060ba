// OTA orchestration state machine. One step function per invocation: block
// on the relevant signals, then compute an explicit transition for the
// current state. No state is terminal; a fatal error halts the owning task
// and the device supervisor restarts the whole process back into Init.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::flash::{
    FirmwareFlash, BOOTLOADER_LEN, BOOTLOADER_OFFSET, PARTITION_TABLE_LEN,
    PARTITION_TABLE_OFFSET,
};
use crate::pipeline::{self, UpdateError, UpdatePolicy};
use crate::signals::{SignalSet, Signals};
use crate::store::{PersistentStore, StoreError};
use crate::system::SystemControl;
use crate::transport::FirmwareFetcher;

/// How long the application loop idles between signal checks.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Init,
    WaitForConnectivity,
    ApplicationLoop,
    UpdateRequested,
}

/// Errors the step function cannot absorb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    /// Unrecoverable for this attempt; the owning task must halt and let
    /// the supervisor restart the device.
    Task(UpdateError),
    /// The persistent store cannot be brought up; the whole process must
    /// abort.
    Process(StoreError),
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::Task(err) => write!(f, "update attempt failed: {err}"),
            Fatal::Process(err) => write!(f, "persistent store unusable: {err}"),
        }
    }
}

impl std::error::Error for Fatal {}

pub struct Orchestrator<F, FL, ST, SY> {
    signals: Arc<SignalSet>,
    fetcher: F,
    flash: FL,
    store: ST,
    system: SY,
    policy: UpdatePolicy,
}

impl<F, FL, ST, SY> Orchestrator<F, FL, ST, SY>
where
    F: FirmwareFetcher,
    FL: FirmwareFlash,
    ST: PersistentStore,
    SY: SystemControl,
{
    pub fn new(
        signals: Arc<SignalSet>,
        fetcher: F,
        flash: FL,
        store: ST,
        system: SY,
        policy: UpdatePolicy,
    ) -> Self {
        Self { signals, fetcher, flash, store, system, policy }
    }

    /// Advance the state machine by one transition. Blocks on the signal
    /// set first in every state except `Init`.
    pub fn step(&mut self, state: OtaState) -> Result<OtaState, Fatal> {
        let observed = self.wait_for_signals(state);
        match state {
            OtaState::Init => self.on_init(),
            OtaState::WaitForConnectivity => Ok(self.on_wait_for_connectivity(observed)),
            OtaState::ApplicationLoop => Ok(self.on_application_loop(observed)),
            OtaState::UpdateRequested => self.on_update_requested(observed),
        }
    }

    fn wait_for_signals(&self, state: OtaState) -> Signals {
        let mask = match state {
            OtaState::Init => return Signals::NONE,
            OtaState::WaitForConnectivity => Signals::CONNECTED | Signals::DISCONNECTED,
            OtaState::ApplicationLoop | OtaState::UpdateRequested => {
                Signals::CONNECTED | Signals::DISCONNECTED | Signals::UPDATE_REQUESTED
            }
        };
        if state != OtaState::ApplicationLoop {
            self.signals.clear(Signals::NORMAL_OPERATION);
        }
        // No timeout: while disconnected the orchestrator makes no forward
        // progress at all.
        self.signals.wait_any(mask, None)
    }

    fn on_init(&mut self) -> Result<OtaState, Fatal> {
        info!("state INIT");
        self.signals.clear(Signals::NORMAL_OPERATION);
        self.log_partition_diagnostics();

        match self.store.init() {
            Ok(()) => {}
            Err(StoreError::LayoutMismatch) => {
                // Typically a partition table with a smaller store region
                // than the one that wrote the old contents.
                warn!("persistent store layout mismatch, erasing and reinitializing");
                self.store.erase().map_err(Fatal::Process)?;
                self.store.init().map_err(Fatal::Process)?;
            }
            Err(err) => return Err(Fatal::Process(err)),
        }

        info!("set to WAIT_FOR_CONNECTIVITY");
        Ok(OtaState::WaitForConnectivity)
    }

    // Read-only startup diagnostics; failures here are reported, never
    // escalated.
    fn log_partition_diagnostics(&self) {
        match self.flash.region_digest(BOOTLOADER_OFFSET, BOOTLOADER_LEN) {
            Ok(digest) => info!("sha256 for bootloader: {}", digest_hex(&digest)),
            Err(err) => warn!("bootloader digest unavailable: {err}"),
        }
        match self.flash.region_digest(PARTITION_TABLE_OFFSET, PARTITION_TABLE_LEN) {
            Ok(digest) => info!("sha256 for the partition table: {}", digest_hex(&digest)),
            Err(err) => warn!("partition table digest unavailable: {err}"),
        }
        match self.flash.running_partition() {
            Ok(part) => {
                if let Ok(digest) = self.flash.partition_digest(&part) {
                    info!("sha256 for current firmware: {}", digest_hex(&digest));
                }
                info!("running partition: {}", part.label);
                match self.flash.app_descriptor(&part) {
                    Ok(Some(desc)) => info!("running firmware version: {}", desc.version),
                    Ok(None) => info!("running partition carries no descriptor"),
                    Err(err) => warn!("could not read the running descriptor: {err}"),
                }
            }
            Err(err) => warn!("running partition unavailable: {err}"),
        }
        match self.flash.factory_partition() {
            Ok(Some(part)) => info!("factory partition: {part}"),
            Ok(None) => info!("no factory partition in the layout"),
            Err(err) => warn!("factory partition unavailable: {err}"),
        }
    }

    fn on_wait_for_connectivity(&self, observed: Signals) -> OtaState {
        // Disconnected wins if the monitor ever asserts both flags at once.
        if observed.contains(Signals::DISCONNECTED) {
            info!("WAIT_FOR_CONNECTIVITY: not connected, waiting for the connect");
            return OtaState::WaitForConnectivity;
        }
        if observed.contains(Signals::CONNECTED) {
            info!("WAIT_FOR_CONNECTIVITY: connected, set to APPLICATION_LOOP");
            self.signals.set(Signals::NORMAL_OPERATION);
            return OtaState::ApplicationLoop;
        }
        OtaState::WaitForConnectivity
    }

    fn on_application_loop(&mut self, observed: Signals) -> OtaState {
        if !self.connection_healthy(observed, "APPLICATION_LOOP") {
            return OtaState::WaitForConnectivity;
        }
        if observed.contains(Signals::UPDATE_REQUESTED) {
            debug!("APPLICATION_LOOP: update trigger consumed");
            self.signals.clear(Signals::UPDATE_REQUESTED);
            return OtaState::UpdateRequested;
        }
        self.system.sleep(IDLE_INTERVAL);
        OtaState::ApplicationLoop
    }

    fn on_update_requested(&mut self, observed: Signals) -> Result<OtaState, Fatal> {
        if !self.connection_healthy(observed, "UPDATE_REQUESTED") {
            return Ok(OtaState::WaitForConnectivity);
        }
        debug!("UPDATE_REQUESTED: starting download");
        match pipeline::run(&mut self.fetcher, &mut self.flash, &self.system, &self.policy) {
            Ok(outcome) => {
                info!("update attempt finished: {outcome:?}");
                Ok(OtaState::ApplicationLoop)
            }
            Err(err) => Err(Fatal::Task(err)),
        }
    }

    // Shared connection guard for both loop states.
    fn connection_healthy(&self, observed: Signals, state_name: &str) -> bool {
        if observed.contains(Signals::DISCONNECTED) {
            error!("{state_name}: not connected, wait for the connect");
            return false;
        }
        true
    }
}

fn digest_hex(digest: &[u8; 32]) -> String {
    use core::fmt::Write;
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{fixture, image_chunks, Fixture, ScriptedStream};
    use proptest::prelude::*;

    #[test]
    fn init_transitions_to_wait_for_connectivity() {
        let mut fx = fixture();
        let next = fx.orchestrator.step(OtaState::Init).expect("init succeeds");
        assert_eq!(next, OtaState::WaitForConnectivity);
        assert_eq!(fx.store.inits.get(), 1);
        assert_eq!(fx.store.erases.get(), 0);
    }

    #[test]
    fn init_recovers_from_a_store_layout_mismatch() {
        let mut fx = fixture();
        fx.store.fail_first_init_with_mismatch();
        let next = fx.orchestrator.step(OtaState::Init).expect("recovery succeeds");
        assert_eq!(next, OtaState::WaitForConnectivity);
        assert_eq!(fx.store.erases.get(), 1);
        assert_eq!(fx.store.inits.get(), 2);
    }

    #[test]
    fn init_aborts_when_store_recovery_fails_too() {
        let mut fx = fixture();
        fx.store.fail_first_init_with_mismatch();
        fx.store.erase_fails.set(true);
        let err = fx.orchestrator.step(OtaState::Init).unwrap_err();
        assert!(matches!(err, Fatal::Process(_)));
    }

    #[test]
    fn init_aborts_on_a_non_recoverable_store_failure() {
        let mut fx = fixture();
        fx.store.fail_first_init_hard();
        let err = fx.orchestrator.step(OtaState::Init).unwrap_err();
        assert!(matches!(err, Fatal::Process(StoreError::Failed(_))));
    }

    #[test]
    fn disconnected_keeps_waiting_for_connectivity() {
        let mut fx = fixture();
        fx.signals.set(Signals::DISCONNECTED);
        let next = fx.orchestrator.step(OtaState::WaitForConnectivity).expect("step");
        assert_eq!(next, OtaState::WaitForConnectivity);
        assert!(!fx.signals.snapshot().contains(Signals::NORMAL_OPERATION));
    }

    #[test]
    fn connected_enters_the_application_loop_and_reports_normal_operation() {
        let mut fx = fixture();
        fx.signals.set(Signals::CONNECTED);
        let next = fx.orchestrator.step(OtaState::WaitForConnectivity).expect("step");
        assert_eq!(next, OtaState::ApplicationLoop);
        assert!(fx.signals.snapshot().contains(Signals::NORMAL_OPERATION));
    }

    #[test]
    fn disconnected_wins_when_both_connectivity_flags_are_asserted() {
        let mut fx = fixture();
        fx.signals.set(Signals::CONNECTED | Signals::DISCONNECTED);
        let next = fx.orchestrator.step(OtaState::WaitForConnectivity).expect("step");
        assert_eq!(next, OtaState::WaitForConnectivity);
    }

    #[test]
    fn application_loop_idles_while_connected_and_untriggered() {
        let mut fx = fixture();
        fx.signals.set(Signals::CONNECTED | Signals::NORMAL_OPERATION);
        let next = fx.orchestrator.step(OtaState::ApplicationLoop).expect("step");
        assert_eq!(next, OtaState::ApplicationLoop);
        assert_eq!(fx.system.sleeps.get(), 1);
        // The idle pass through the loop must not drop the normal-operation
        // flag the application task is waiting on.
        assert!(fx.signals.snapshot().contains(Signals::NORMAL_OPERATION));
    }

    #[test]
    fn application_loop_consumes_the_trigger_exactly_once() {
        let mut fx = fixture();
        fx.signals.set(Signals::CONNECTED | Signals::UPDATE_REQUESTED);
        let next = fx.orchestrator.step(OtaState::ApplicationLoop).expect("step");
        assert_eq!(next, OtaState::UpdateRequested);
        assert!(!fx.signals.snapshot().contains(Signals::UPDATE_REQUESTED));
    }

    #[test]
    fn disconnect_preempts_a_pending_trigger() {
        let mut fx = fixture();
        fx.signals.set(Signals::DISCONNECTED | Signals::UPDATE_REQUESTED);
        let next = fx.orchestrator.step(OtaState::ApplicationLoop).expect("step");
        assert_eq!(next, OtaState::WaitForConnectivity);
        // The trigger is neither lost nor acted upon while disconnected.
        assert!(fx.signals.snapshot().contains(Signals::UPDATE_REQUESTED));
        assert_eq!(fx.fetcher.opens.get(), 0);
    }

    #[test]
    fn pending_trigger_survives_a_reconnect_cycle() {
        let mut fx = fixture();
        fx.signals.set(Signals::DISCONNECTED | Signals::UPDATE_REQUESTED);
        let mut state = OtaState::ApplicationLoop;
        state = fx.orchestrator.step(state).expect("step");
        assert_eq!(state, OtaState::WaitForConnectivity);

        fx.signals.clear(Signals::DISCONNECTED);
        fx.signals.set(Signals::CONNECTED);
        state = fx.orchestrator.step(state).expect("step");
        assert_eq!(state, OtaState::ApplicationLoop);

        state = fx.orchestrator.step(state).expect("step");
        assert_eq!(state, OtaState::UpdateRequested);
        assert!(!fx.signals.snapshot().contains(Signals::UPDATE_REQUESTED));
    }

    #[test]
    fn update_requested_backs_off_while_disconnected() {
        let mut fx = fixture();
        fx.signals.set(Signals::DISCONNECTED);
        let next = fx.orchestrator.step(OtaState::UpdateRequested).expect("step");
        assert_eq!(next, OtaState::WaitForConnectivity);
        assert_eq!(fx.fetcher.opens.get(), 0);
    }

    #[test]
    fn update_requested_runs_the_pipeline_and_returns_to_the_loop() {
        let mut fx = fixture();
        fx.fetcher.queue_stream(ScriptedStream::new(
            image_chunks("9.9.9", 2048, crate::pipeline::CHUNK_SIZE),
            true,
        ));
        fx.signals.set(Signals::CONNECTED);
        let next = fx.orchestrator.step(OtaState::UpdateRequested).expect("step");
        assert_eq!(next, OtaState::ApplicationLoop);
        assert_eq!(fx.fetcher.opens.get(), 1);
        assert_eq!(fx.system.restarts.get(), 1);
        assert_eq!(fx.flash_state.borrow().commits, 1);
    }

    #[test]
    fn pipeline_failure_is_a_task_fatal() {
        let mut fx = fixture();
        fx.fetcher.connect_fails.set(true);
        fx.signals.set(Signals::CONNECTED);
        let err = fx.orchestrator.step(OtaState::UpdateRequested).unwrap_err();
        assert!(matches!(err, Fatal::Task(UpdateError::Connect(_))));
    }

    proptest! {
        // Whatever else is pending, an asserted disconnect always sends the
        // application loop back to waiting for connectivity.
        #[test]
        fn disconnect_always_preempts_everything(
            ops in proptest::collection::vec((0u8..3, any::<bool>()), 0..16)
        ) {
            let mut fx: Fixture = fixture();
            for (which, set) in ops {
                let signal = match which {
                    0 => Signals::CONNECTED,
                    1 => Signals::UPDATE_REQUESTED,
                    _ => Signals::NORMAL_OPERATION,
                };
                if set {
                    fx.signals.set(signal);
                } else {
                    fx.signals.clear(signal);
                }
            }
            fx.signals.set(Signals::DISCONNECTED);
            let trigger_was_pending =
                fx.signals.snapshot().contains(Signals::UPDATE_REQUESTED);

            let next = fx.orchestrator.step(OtaState::ApplicationLoop).expect("step");

            prop_assert_eq!(next, OtaState::WaitForConnectivity);
            prop_assert_eq!(fx.fetcher.opens.get(), 0);
            if trigger_was_pending {
                prop_assert!(fx.signals.snapshot().contains(Signals::UPDATE_REQUESTED));
            }
        }
    }
}
