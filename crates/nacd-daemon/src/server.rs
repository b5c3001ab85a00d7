//! Hook socket server.
//!
//! Accepts one short-lived connection per DHCP hook invocation and processes
//! it to completion: read the full envelope, parse the event, apply it to
//! the lease store, write back a single status byte, close. The protocol is
//! strictly request/response with one exchange per connection.
//!
//! # Socket lifecycle
//!
//! The listening socket is either bound fresh (stale socket files are
//! removed, permissions set after bind) or inherited through the systemd
//! socket-activation convention (`LISTEN_FDS`/`LISTEN_PID`, first fd at 3).
//! Inheritance is a liveness requirement, not an optimization: a DHCP
//! daemon that cannot reach the hook socket while this server restarts must
//! not silently drop the lease event.
//!
//! # Isolation
//!
//! A malformed or failing exchange affects only its own connection; the
//! status byte reports the failure class to the hook client (and through it
//! to the DHCP daemon), and the accept loop keeps serving.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use nacd_core::config::ServerConfig;
use nacd_core::event::{self, HookRequest};
use nacd_core::wire::{self, exit};
use tokio::net::UnixListener;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::store::LeaseStore;

/// First inherited descriptor under the socket-activation convention.
const LISTEN_FDS_START: i32 = 3;

/// Socket file permissions: owner and group may connect.
const SOCKET_MODE: u32 = 0o660;

/// The lease hook server.
#[derive(Debug)]
pub struct LeaseServer {
    listener: UnixListener,
    store: Arc<LeaseStore>,
    connection_sem: Arc<Semaphore>,
    /// Set when this server owns the socket file and must remove it.
    cleanup_path: Option<PathBuf>,
}

impl LeaseServer {
    /// Bind a fresh listening socket at the configured path.
    ///
    /// Creates the parent directory if needed, removes a stale socket file,
    /// binds, and sets permissions after binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, a non-socket
    /// file occupies the path, or binding fails.
    pub fn bind(config: &ServerConfig, store: Arc<LeaseStore>) -> io::Result<Self> {
        let path = &config.socket_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::cleanup_stale_socket(path)?;

        let std_listener = StdUnixListener::bind(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to bind hook socket {}: {e}", path.display()),
            )
        })?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        std_listener.set_nonblocking(true)?;

        info!(
            socket = %path.display(),
            max_connections = config.max_connections,
            "hook socket bound"
        );
        Ok(Self {
            listener: UnixListener::from_std(std_listener)?,
            store,
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            cleanup_path: Some(path.clone()),
        })
    }

    /// Adopt a listener inherited via socket activation, if one was passed.
    ///
    /// Returns `Ok(None)` when the environment does not describe an
    /// inherited socket for this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the inherited descriptor cannot be configured.
    pub fn inherited(config: &ServerConfig, store: Arc<LeaseStore>) -> io::Result<Option<Self>> {
        let listen_pid = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse::<i32>().ok());
        let listen_fds = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);

        if listen_pid != Some(nix::unistd::getpid().as_raw()) || listen_fds < 1 {
            return Ok(None);
        }
        if listen_fds > 1 {
            warn!(listen_fds, "multiple inherited sockets; using the first");
        }

        // The activation convention guarantees fd 3 is ours and open; we
        // take ownership of it here.
        let std_listener = unsafe { StdUnixListener::from_raw_fd(LISTEN_FDS_START) };
        std_listener.set_nonblocking(true)?;

        info!("adopted inherited hook socket");
        Ok(Some(Self {
            listener: UnixListener::from_std(std_listener)?,
            store,
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            cleanup_path: None,
        }))
    }

    fn cleanup_stale_socket(path: &Path) -> io::Result<()> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                if !metadata.file_type().is_socket() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("path {} exists but is not a socket", path.display()),
                    ));
                }
                std::fs::remove_file(path)?;
                debug!(path = %path.display(), "removed stale socket file");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Serve connections until `shutdown` flips to `true` or its sender
    /// drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let permit = match Arc::clone(&self.connection_sem).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            tokio::select! {
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        },
                    };
                    // Detach from the runtime here; the exchange itself is a
                    // synchronous recvmsg loop and runs on a blocking worker.
                    let std_stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "failed to detach connection from the runtime");
                            continue;
                        },
                    };
                    let store = Arc::clone(&self.store);
                    tokio::task::spawn_blocking(move || {
                        handle_connection(std_stream, &store);
                        drop(permit);
                    });
                },
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
        info!("hook server stopped");
    }
}

impl Drop for LeaseServer {
    fn drop(&mut self) {
        if let Some(path) = self.cleanup_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
    }
}

/// Process one hook exchange on a blocking worker.
///
/// The descriptor-passing receive is a synchronous `recvmsg` loop, so the
/// whole exchange runs off the async executor.
fn handle_connection(mut stream: std::os::unix::net::UnixStream, store: &LeaseStore) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(error = %e, "failed to make connection blocking");
        return;
    }

    let status = exchange(&stream, store);
    if let Err(e) = wire::send_status(&mut stream, status) {
        debug!(error = %e, "failed to write status byte");
    }
}

/// Run the request/response exchange and compute the status byte.
fn exchange(stream: &std::os::unix::net::UnixStream, store: &LeaseStore) -> u8 {
    let (invocation, stdio) = match wire::recv_invocation(stream) {
        Ok(received) => received,
        Err(e) => {
            warn!(error = %e, "failed to receive hook invocation");
            return e.exit_code();
        },
    };

    let received_at = Utc::now();
    let request = match event::parse_request(&invocation, received_at) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "failed to parse hook invocation");
            // Mirror the message to the hook's stderr so it lands in the
            // DHCP daemon's log as well.
            let mut hook_stderr = File::from(stdio.stderr);
            let _ = writeln!(hook_stderr, "{e}");
            return exit::USAGE;
        },
    };

    match request {
        HookRequest::Init => {
            debug!("hook init: dumping lease state");
            let records = match store.snapshot() {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "failed to snapshot lease store");
                    return exit::SOFTWARE;
                },
            };
            let mut hook_stdout = File::from(stdio.stdout);
            for record in &records {
                if let Err(e) = hook_stdout.write_all(record.leasefile_line().as_bytes()) {
                    warn!(error = %e, "failed to write lease dump");
                    return exit::SOFTWARE;
                }
            }
            if let Err(e) = hook_stdout.flush() {
                warn!(error = %e, "failed to flush lease dump");
                return exit::SOFTWARE;
            }
            debug!(leases = records.len(), "lease dump complete");
            exit::OK
        },
        HookRequest::Event(lease_event) => {
            debug!(
                command = %lease_event.command,
                ip = %lease_event.ip,
                "applying lease event"
            );
            match store.apply_event(&lease_event, received_at) {
                Ok(()) => exit::OK,
                Err(e) => {
                    warn!(error = %e, "failed to apply lease event");
                    let mut hook_stderr = File::from(stdio.stderr);
                    let _ = writeln!(hook_stderr, "{e}");
                    exit::SOFTWARE
                },
            }
        },
    }
}
