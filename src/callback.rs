//! Process-wide registry wiring push-mode sources to consumers by name.
//!
//! A push-mode link does not own a consumer thread: the source's IO thread
//! delivers each frame straight into the pipeline through a callback the
//! consumer registered under the connection name. Registration happens at
//! `conf`, deregistration at `scrap`; the registry itself lives for the
//! whole process.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::frame::FrameType;

/// A registered frame-consume callback.
pub type FrameCallback<F> = Arc<dyn Fn(F) + Send + Sync>;

static REGISTRY: Lazy<DataMoveCallbackRegistry> = Lazy::new(DataMoveCallbackRegistry::new);

/// Name→callback map, type-erased so one registry serves every frame type in
/// the process.
pub struct DataMoveCallbackRegistry {
    callbacks: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl DataMoveCallbackRegistry {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide instance.
    pub fn instance() -> &'static Self {
        &REGISTRY
    }

    /// Registers `callback` under `name`, replacing any previous entry.
    pub fn register_callback<F: FrameType>(&self, name: &str, callback: FrameCallback<F>) {
        debug!(name, "registering data-move callback");
        self.callbacks
            .lock()
            .insert(name.to_owned(), Box::new(callback));
    }

    /// Looks up the callback registered under `name` for frame type `F`.
    /// Returns `None` when the name is unknown or was registered for a
    /// different frame type.
    pub fn get_callback<F: FrameType>(&self, name: &str) -> Option<FrameCallback<F>> {
        self.callbacks
            .lock()
            .get(name)
            .and_then(|any| any.downcast_ref::<FrameCallback<F>>())
            .cloned()
    }

    /// Removes the entry for `name`, if any.
    pub fn deregister(&self, name: &str) {
        if self.callbacks.lock().remove(name).is_some() {
            debug!(name, "deregistered data-move callback");
        }
    }
}
