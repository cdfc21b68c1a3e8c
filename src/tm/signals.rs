//! Signal name table and dispatch to children.
//!
//! Names are accepted with or without the `SIG` prefix, case-insensitive.

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::tm::error::Fault;

/// Resolves a textual signal name to a platform signal.
pub fn parse_signal(s: &str) -> Result<Signal, Fault> {
    let raw = s.trim().to_uppercase();
    let name = raw.strip_prefix("SIG").unwrap_or(&raw);
    let sig = match name {
        "HUP" => Signal::SIGHUP,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "ILL" => Signal::SIGILL,
        "TRAP" => Signal::SIGTRAP,
        "ABRT" => Signal::SIGABRT,
        "BUS" => Signal::SIGBUS,
        "FPE" => Signal::SIGFPE,
        "KILL" => Signal::SIGKILL,
        "USR1" => Signal::SIGUSR1,
        "SEGV" => Signal::SIGSEGV,
        "USR2" => Signal::SIGUSR2,
        "PIPE" => Signal::SIGPIPE,
        "ALRM" => Signal::SIGALRM,
        "TERM" => Signal::SIGTERM,
        "CHLD" => Signal::SIGCHLD,
        "CONT" => Signal::SIGCONT,
        "STOP" => Signal::SIGSTOP,
        "TSTP" => Signal::SIGTSTP,
        "TTIN" => Signal::SIGTTIN,
        "TTOU" => Signal::SIGTTOU,
        "URG" => Signal::SIGURG,
        "XCPU" => Signal::SIGXCPU,
        "XFSZ" => Signal::SIGXFSZ,
        "VTALRM" => Signal::SIGVTALRM,
        "PROF" => Signal::SIGPROF,
        "WINCH" => Signal::SIGWINCH,
        "IO" => Signal::SIGIO,
        "SYS" => Signal::SIGSYS,
        _ => return Err(Fault::BadSignal(s.to_string())),
    };
    Ok(sig)
}

/// Sends `sig` to `pid`, or to its whole process group when `to_group`.
///
/// Children are spawned with `setsid`, so the group id equals the child
/// pid.
pub fn send_signal(pid: u32, sig: Signal, to_group: bool) -> nix::Result<()> {
    let target = Pid::from_raw(pid as i32);
    if to_group {
        killpg(target, sig)
    } else {
        kill(target, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bare_and_prefixed_names() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigusr2").unwrap(), Signal::SIGUSR2);
        assert_eq!(parse_signal(" hup ").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn rejects_unknown_names() {
        let err = parse_signal("NOTASIG").unwrap_err();
        assert_eq!(err.as_label(), "bad_signal");
        assert!(parse_signal("").is_err());
        // Numbers are not names; the RPC layer resolves names only.
        assert!(parse_signal("9").is_err());
    }
}
