use crate::config::Config;
use crate::report::MetricsCallback;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::debug;

/// The currently bound metrics callback plus its settings; what the
/// instrumented request path consults on every call.
#[derive(Clone)]
pub struct Recorder {
    pub(crate) callback: MetricsCallback,
    pub(crate) config: Config,
    epoch: u64,
}

impl Recorder {
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Proof of a successful [`start`]; required to [`stop`] again. Only the
/// handle from the install that is actually active can uninstall it.
#[derive(Debug)]
pub struct InstrumentHandle {
    epoch: u64,
}

struct InstallState {
    current: Option<Recorder>,
    epoch: u64,
}

// The only process-wide mutable state in the crate.
static INSTALLED: OnceLock<Mutex<InstallState>> = OnceLock::new();

fn state() -> MutexGuard<'static, InstallState> {
    let lock = INSTALLED.get_or_init(|| {
        Mutex::new(InstallState {
            current: None,
            epoch: 0,
        })
    });
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Binds the metrics callback process-wide. Idempotent: a second call while
/// already installed keeps the first-registered callback and returns a
/// handle to that install.
pub fn start(callback: MetricsCallback, config: Config) -> InstrumentHandle {
    let mut st = state();
    match &st.current {
        Some(recorder) => {
            debug!("instrumentation already installed, keeping existing callback");
            InstrumentHandle {
                epoch: recorder.epoch,
            }
        }
        None => {
            st.epoch += 1;
            let epoch = st.epoch;
            st.current = Some(Recorder {
                callback,
                config,
                epoch,
            });
            debug!("instrumentation installed");
            InstrumentHandle { epoch }
        }
    }
}

/// Uninstalls, but only if `handle` belongs to the active install; a stale
/// handle or an uninstalled state is a no-op.
pub fn stop(handle: InstrumentHandle) {
    let mut st = state();
    match &st.current {
        Some(recorder) if recorder.epoch == handle.epoch => {
            st.current = None;
            debug!("instrumentation uninstalled");
        }
        _ => {}
    }
}

/// The active recorder, if instrumentation is installed.
pub fn current() -> Option<Recorder> {
    state().current.clone()
}
