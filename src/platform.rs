//! Process-wide networking subsystem lifecycle.
//!
//! Winsock has to be started before the first socket call and should be
//! cleaned up once the application is done with networking; BSD sockets need
//! neither, so both calls are no-ops there.
//!
//! [`initialize`] is idempotent and is also called by every socket
//! constructor, so applications only have to care about it if they want to
//! control when startup happens. [`finalize`] is idempotent as well and is
//! meant to be called once at shutdown, after every socket has been closed.
//! [`SubsystemGuard`] ties both to a scope.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::{Error, sys};

static INITIALIZED: Mutex<bool> = Mutex::new(false);

pub fn initialize() -> crate::Result<()> {
    let mut initialized = INITIALIZED.lock().unwrap_or_else(PoisonError::into_inner);
    if *initialized {
        return Ok(());
    }
    sys::startup().map_err(|e| Error::Unknown {
        op: "start networking subsystem",
        code: e.raw_os_error(),
        message: e.to_string(),
    })?;
    *initialized = true;
    debug!("networking subsystem initialized");
    Ok(())
}

pub fn finalize() {
    let mut initialized = INITIALIZED.lock().unwrap_or_else(PoisonError::into_inner);
    if !*initialized {
        return;
    }
    sys::cleanup();
    *initialized = false;
    debug!("networking subsystem finalized");
}

pub fn is_initialized() -> bool {
    *INITIALIZED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Calls [`initialize`] on creation and [`finalize`] on drop.
#[derive(Debug)]
#[must_use = "the subsystem is finalized when the guard is dropped"]
pub struct SubsystemGuard {
    _priv: (),
}

impl SubsystemGuard {
    pub fn new() -> crate::Result<Self> {
        initialize()?;
        Ok(Self { _priv: () })
    }
}

impl Drop for SubsystemGuard {
    fn drop(&mut self) {
        finalize();
    }
}
