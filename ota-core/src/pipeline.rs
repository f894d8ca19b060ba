// Download & flash pipeline: stream the image from the remote source,
// validate its descriptor against the running and last-invalid images,
// write it to the inactive partition and switch the boot target.
//
// Invariant held on every path: no partial write is ever left marked
// bootable. The session is aborted before any fatal return.

use core::fmt;

use log::{debug, error, info, warn};

use crate::flash::{FirmwareFlash, FlashError, WriteSession};
use crate::image::{AppDescriptor, ImageError, MIN_HEAD_LEN};
use crate::system::SystemControl;
use crate::transport::{FirmwareFetcher, ImageStream, StreamError, StreamRead};

/// Fixed chunk size for streaming the image body. The buffer is owned by
/// one attempt and dropped with it.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct UpdatePolicy {
    /// Accept an image whose version matches the running one instead of
    /// rejecting it as a no-op.
    pub skip_version_check: bool,
}

/// Why an offered image was refused without writing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The offered version failed to boot before and was rolled back.
    SameAsLastInvalid(String),
    /// The offered version is already running.
    SameAsRunning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Boot target switched; a restart was requested.
    Committed { version: String, bytes: usize },
    /// Policy rejection; the device was parked to wait for a different
    /// image.
    Rejected(Rejection),
}

/// Fatal-for-this-attempt failures. The owning task halts on any of these;
/// recovery is a process-level restart, never an in-process retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    Connect(StreamError),
    /// First chunk too small to contain the image header and descriptor.
    ShortHeader { len: usize },
    MalformedImage(ImageError),
    Stream(StreamError),
    Flash(FlashError),
    Write(FlashError),
    /// The stream ended but the transport did not deliver the full body.
    Incomplete { received: usize },
    Commit(FlashError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Connect(err) => {
                write!(f, "failed to reach the firmware source: {err}")
            }
            UpdateError::ShortHeader { len } => {
                write!(f, "first chunk of {len} bytes cannot contain the image descriptor")
            }
            UpdateError::MalformedImage(err) => write!(f, "malformed image head: {err}"),
            UpdateError::Stream(err) => write!(f, "stream failed: {err}"),
            UpdateError::Flash(err) => write!(f, "flash access failed: {err}"),
            UpdateError::Write(err) => write!(f, "image write failed: {err}"),
            UpdateError::Incomplete { received } => {
                write!(f, "stream ended after {received} bytes without the full image")
            }
            UpdateError::Commit(err) => write!(f, "boot target commit failed: {err}"),
        }
    }
}

impl std::error::Error for UpdateError {}

/// Run one update attempt to completion.
///
/// Returns `Ok` only for the two non-fatal outcomes; on `Committed` the
/// device restart has already been requested. Every `Err` leaves the boot
/// target untouched and any open write session aborted.
pub fn run<F, S, C>(
    fetcher: &mut F,
    flash: &mut S,
    system: &C,
    policy: &UpdatePolicy,
) -> Result<UpdateOutcome, UpdateError>
where
    F: FirmwareFetcher,
    S: FirmwareFlash,
    C: SystemControl,
{
    let configured = flash.boot_partition().map_err(UpdateError::Flash)?;
    let running = flash.running_partition().map_err(UpdateError::Flash)?;
    if configured.address != running.address {
        warn!("configured boot partition is {configured} but running from {running}");
        warn!("(boot data or the preferred boot image may have been corrupted)");
    }
    info!("starting update, running partition {running}");

    let mut stream = fetcher.open().map_err(|err| {
        error!("failed to open the firmware source: {err}");
        UpdateError::Connect(err)
    })?;

    let target = flash.next_update_partition().map_err(UpdateError::Flash)?;
    info!("writing to partition {target}");

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut session: Option<S::Session> = None;
    let mut new_version: Option<String> = None;
    let mut received = 0usize;

    loop {
        match stream.read(&mut buf) {
            Err(err) => {
                error!("transport failed mid-stream: {err}");
                if let Some(open) = session.take() {
                    open.abort();
                }
                return Err(UpdateError::Stream(err));
            }
            Ok(StreamRead::Pending) => continue,
            Ok(StreamRead::Closed) => break,
            Ok(StreamRead::Data(n)) => {
                if session.is_none() {
                    // Nothing touches the flash until the head is validated
                    // and both version guards have passed.
                    if n < MIN_HEAD_LEN {
                        error!("received package does not fit, len {n}");
                        return Err(UpdateError::ShortHeader { len: n });
                    }
                    let offered = AppDescriptor::parse_image_head(&buf[..n])
                        .map_err(UpdateError::MalformedImage)?;
                    info!("new firmware version: {}", offered.version);

                    let running_desc =
                        flash.app_descriptor(&running).map_err(UpdateError::Flash)?;
                    if let Some(desc) = &running_desc {
                        info!("running firmware version: {}", desc.version);
                    }

                    let invalid_desc =
                        match flash.last_invalid_partition().map_err(UpdateError::Flash)? {
                            Some(part) => {
                                flash.app_descriptor(&part).map_err(UpdateError::Flash)?
                            }
                            None => None,
                        };
                    if let Some(desc) = &invalid_desc {
                        info!("last invalid firmware version: {}", desc.version);
                        if desc.version == offered.version {
                            warn!(
                                "version {} failed to boot before and was rolled back",
                                offered.version
                            );
                            warn!("refusing to download it again; waiting for a different image");
                            drop(stream);
                            system.idle_until_reset();
                            return Ok(UpdateOutcome::Rejected(Rejection::SameAsLastInvalid(
                                offered.version,
                            )));
                        }
                    }
                    if !policy.skip_version_check {
                        if let Some(desc) = &running_desc {
                            if desc.version == offered.version {
                                warn!(
                                    "version {} is already running, not continuing the update",
                                    offered.version
                                );
                                drop(stream);
                                system.idle_until_reset();
                                return Ok(UpdateOutcome::Rejected(Rejection::SameAsRunning(
                                    offered.version,
                                )));
                            }
                        }
                    }

                    session = Some(flash.begin_update(&target).map_err(|err| {
                        error!("could not open the write session: {err}");
                        UpdateError::Flash(err)
                    })?);
                    new_version = Some(offered.version);
                    debug!("write session opened");
                }

                match session.as_mut().map(|open| open.write(&buf[..n])) {
                    Some(Ok(())) => {
                        received += n;
                        debug!("written image length {received}");
                    }
                    Some(Err(err)) => {
                        error!("flash write failed after {received} bytes: {err}");
                        if let Some(open) = session.take() {
                            open.abort();
                        }
                        return Err(UpdateError::Write(err));
                    }
                    None => {}
                }
            }
        }
    }

    info!("total received image length: {received}");
    if !stream.is_complete() {
        error!("transport closed before the full image was delivered");
        if let Some(open) = session.take() {
            open.abort();
        }
        return Err(UpdateError::Incomplete { received });
    }

    let (open, version) = match (session.take(), new_version.take()) {
        (Some(open), Some(version)) => (open, version),
        _ => {
            // Clean close before a single parseable head chunk arrived.
            error!("stream ended after {received} bytes without a parseable image head");
            return Err(UpdateError::ShortHeader { len: received });
        }
    };

    open.commit().map_err(|err| {
        error!("boot target commit failed: {err}");
        UpdateError::Commit(err)
    })?;
    info!("boot target set to {target}");

    // The remembered bad version belongs to an attempt that is now obsolete.
    if let Err(err) = flash.clear_last_invalid() {
        warn!("could not clear the stale invalid-image marker: {err}");
    }

    info!("prepare to restart system");
    system.restart();
    Ok(UpdateOutcome::Committed {
        version,
        bytes: received,
    })
}
