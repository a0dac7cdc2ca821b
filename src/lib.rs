//! sandbox - Named chroot sandboxes
//!
//! A sandbox is a directory under `/var/sandboxes` which shares most of the
//! host filesystem through hard links and bind mounts, while `/etc` (behind a
//! copy-on-write userspace filesystem), `/root` and `/home` are private.
//!
//! Installs executables:
//! - sandbox-list    - List sandboxes
//! - sandbox-which   - Print the current sandbox name
//! - sandbox-clone   - Create a sandbox from the base system or another sandbox
//! - sandbox-destroy - Tear a sandbox down
//! - sandbox-use     - Run a shell or command inside a sandbox
//! - sandbox-mark    - Promote a file to private and hand it to the blueprint gid
//! - sandboxfs       - The copy-on-write filesystem server mounted over /etc
//!
//! Sandboxes are a convenience, not a security boundary: any root process can
//! leave one the same way `breakout()` does.

mod err;

pub mod logging;

pub mod fs;
pub mod proc;
pub mod temp;
pub mod user;
pub mod util;

pub mod walk;

pub mod copy;
pub mod mount;

pub mod breakout;
pub mod cow;
pub mod cowfs;
pub mod refs;
pub mod services;

pub mod sandbox;

pub use err::{Error, Result};
