//! nacd-dhcp-script - lightweight proxy for dnsmasq `--dhcp-script`
//! invocations.
//!
//! dnsmasq spawns this program for every lease event. It forwards its
//! command-line arguments, the `DNSMASQ_*` environment, and its three
//! standard descriptors over a Unix socket to the long-running lease server,
//! then mirrors the server's one-byte status as its own exit code.
//!
//! The client is deliberately minimal: argv is payload, not options, so
//! there is no argument parsing beyond `-h`/`--help`; it is single-shot and
//! never retries (retries are the DHCP daemon's decision, driven by the
//! exit code); and it holds no configuration beyond the socket path in
//! `NACD_DHCP_SCRIPT_SOCKET`.
//!
//! # Exit codes
//!
//! Load-bearing, per the `sysexits.h` convention the DHCP daemon consumes:
//! 0 success (or the server's status), 64 usage error, 65 data error,
//! 71 OS error.

use std::os::fd::AsFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;

use nacd_core::config::MAX_SOCKET_PATH_LEN;
use nacd_core::event::ENV_PREFIX;
use nacd_core::wire::{self, exit};

/// Environment variable naming the lease server socket.
const SOCKET_VAR: &str = "NACD_DHCP_SCRIPT_SOCKET";

fn print_usage() {
    eprint!(
        "nacd-dhcp-script ARGS...\n\
         \n\
         Sends its command-line arguments, environment variables starting\n\
         with {ENV_PREFIX} and the stdin/stdout/stderr file descriptors to\n\
         the UNIX socket set via the {SOCKET_VAR} environment variable.\n\
         \n\
         Use the `init` command to print out the current state of leases.\n\
         See the -6, --dhcp-script options of dnsmasq for details.\n"
    );
}

fn main() -> ExitCode {
    ExitCode::from(run())
}

fn run() -> u8 {
    let argv: Vec<Vec<u8>> = std::env::args_os()
        .map(OsStringExt::into_vec)
        .collect();
    if argv.len() < 2 {
        print_usage();
        return exit::USAGE;
    }
    let first = argv[1].as_slice();
    if first == b"-h" || first == b"--help" || first == b"help" {
        print_usage();
        return exit::OK;
    }

    // Usage errors fail fast, before any I/O side effect.
    let Some(path) = std::env::var_os(SOCKET_VAR) else {
        eprintln!("You need to set the {SOCKET_VAR} environment variable!");
        return exit::USAGE;
    };
    if path.as_bytes().len() > MAX_SOCKET_PATH_LEN {
        eprintln!(
            "The {SOCKET_VAR} path\n{}\nis too long: {} > {MAX_SOCKET_PATH_LEN}",
            path.to_string_lossy(),
            path.as_bytes().len(),
        );
        return exit::USAGE;
    }

    let env: Vec<(Vec<u8>, Vec<u8>)> = std::env::vars_os()
        .filter(|(key, _)| key.as_bytes().starts_with(ENV_PREFIX.as_bytes()))
        .map(|(key, value)| (OsStringExt::into_vec(key), OsStringExt::into_vec(value)))
        .collect();

    let mut stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!(
                "{e}\nTried socket path: {}.\nHave you forgotten to start the lease server?",
                path.to_string_lossy(),
            );
            return exit::OS_ERR;
        },
    };

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    if let Err(e) = wire::send_invocation(
        &stream,
        &argv,
        &env,
        [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()],
    ) {
        eprintln!("{e}");
        return e.exit_code();
    }

    match wire::recv_status(&mut stream) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        },
    }
}
