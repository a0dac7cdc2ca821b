//! Child process management: fork, signal-aware waiting, exec.

use std::collections::HashMap;
use std::{env, ffi, fmt};

use libc;
use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use log::{debug, warn};

use crate::err::{Error, Result};

/// Managed (child) process
#[derive(Debug)]
pub struct Proc {
    pid: libc::pid_t,
    done: bool,
    code: i32,
}

impl Proc {
    pub fn manage(pid: libc::pid_t) -> Proc {
        assert!(pid > 0);
        Proc {
            pid,
            done: false,
            code: -1, // poison
        }
    }

    pub fn id(&self) -> libc::pid_t {
        self.pid
    }

    /// Send signal to process
    pub fn signal(&self, sig: libc::c_int) -> Result<()> {
        if !self.done {
            debug!("signal PID {} with {}", self.pid, sig);
            unsafe {
                if 0 != libc::kill(self.pid, sig) {
                    return Err(Error::last_os_error("kill"));
                }
            }
        }
        Ok(())
    }

    /// Send SIGKILL to process
    pub fn kill(&self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    /// Block current process until child exits, forwarding interruptions.
    ///
    /// The first two interrupting signals are passed through to the child;
    /// after that it is killed outright.
    pub fn park(&mut self) -> Result<i32> {
        if self.done {
            return Ok(self.code);
        }

        let mut signals =
            Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGCHLD]).map_err(|e| Error::os("signals", e))?;
        let mut isig = signals.forever();

        let mut cnt = 0;

        loop {
            match trywaitpid(self.pid)? {
                TryWait::Busy => (),
                TryWait::Done(_child, sts) => {
                    self.done = true;
                    self.code = sts;
                    return Ok(sts);
                }
            }
            debug!("Waiting for PID {}", self.pid);

            match isig.next() {
                Some(SIGCHLD) => {
                    debug!("SIGCHLD");
                    // loop around to test child
                }
                Some(sig) => {
                    debug!("SIG {}", sig);
                    // we are being interrupted.
                    // be delicate with child at first
                    let num = if cnt < 2 { sig } else { libc::SIGKILL };
                    cnt += 1;
                    self.signal(num)?;
                }
                None => {
                    unreachable!();
                }
            }
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(err) = self.kill() {
            warn!("unable to kill managed PID {} : {}", self.pid, err);
        }
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.done {
            write!(f, "PID {} Exit with {}", self.pid, self.code)
        } else {
            write!(f, "PID {}", self.pid)
        }
    }
}

pub enum TryWait {
    Busy,
    Done(libc::pid_t, i32),
}

fn decode_status(sts: libc::c_int) -> i32 {
    if libc::WIFEXITED(sts) {
        libc::WEXITSTATUS(sts)
    } else if libc::WIFSIGNALED(sts) {
        128 + libc::WTERMSIG(sts)
    } else {
        -1
    }
}

/// Wraps waitpid()
pub fn trywaitpid(pid: libc::pid_t) -> Result<TryWait> {
    let mut sts = 0;
    unsafe {
        let ret = libc::waitpid(pid, &mut sts, libc::WNOHANG);
        if ret == -1 {
            Err(Error::last_os_error("waitpid"))
        } else if ret == 0 {
            Ok(TryWait::Busy)
        } else {
            Ok(TryWait::Done(ret, decode_status(sts)))
        }
    }
}

/// Block until any child exits.  Used to reap traversal fan-out.
pub fn wait_any() -> Result<(libc::pid_t, i32)> {
    let mut sts = 0;
    let ret = unsafe { libc::wait(&mut sts) };
    if ret == -1 {
        Err(Error::last_os_error("wait"))
    } else {
        Ok((ret, decode_status(sts)))
    }
}

pub enum Fork {
    Parent(Proc),
    Child,
}

pub fn fork() -> Result<Fork> {
    unsafe {
        match libc::fork() {
            err if err < 0 => Err(Error::last_os_error("fork")),
            0 => Ok(Fork::Child),
            pid => Ok(Fork::Parent(Proc::manage(pid))),
        }
    }
}

/// execvp() with the caller's environment.  Only returns on failure.
pub struct Exec {
    cmd: ffi::CString,
    args: Vec<ffi::CString>,
    env: HashMap<String, ffi::CString>,
}

impl Exec {
    pub fn new<T>(cmd: T) -> Result<Exec>
    where
        T: AsRef<str>,
    {
        let mut es = HashMap::new();

        // initially populate with process environment
        for (k, v) in env::vars() {
            es.insert(k.clone(), ffi::CString::new(format!("{}={}", &k, &v))?);
        }

        Ok(Exec {
            cmd: ffi::CString::new(cmd.as_ref())?,
            args: vec![],
            env: es,
        })
    }

    pub fn args<I>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for s in args {
            self.args.push(ffi::CString::new(s.as_ref())?);
        }
        Ok(self)
    }

    pub fn exec(&self) -> Error {
        let cmd = self.cmd.as_ptr();
        let mut args: Vec<*const libc::c_char> = self.args.iter().map(|s| s.as_ptr()).collect();
        let mut env: Vec<*const libc::c_char> = self.env.values().map(|v| v.as_ptr()).collect();
        // arrays must be null terminated
        args.push(std::ptr::null());
        env.push(std::ptr::null());

        unsafe {
            libc::execvpe(cmd, args.as_ptr(), env.as_ptr());
        }
        // only returns on error
        Error::last_os_error(format!("exec cmd={:?} args={:?}", self.cmd, self.args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_status() {
        // glibc encodes a normal exit as code << 8
        assert_eq!(decode_status(0), 0);
        assert_eq!(decode_status(1 << 8), 1);
        assert_eq!(decode_status(42 << 8), 42);
        // a termination by SIGKILL reports through the shell convention
        assert_eq!(decode_status(libc::SIGKILL), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_exec_builds_argv() {
        let mut e = Exec::new("/bin/sh").unwrap();
        e.args(["sh", "-c", "true"]).unwrap();
        assert_eq!(e.args.len(), 3);
        assert_eq!(e.cmd.to_str().unwrap(), "/bin/sh");
    }
}
