use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::frame::Frame;

/// A command implementation. It receives the arguments that followed the command name and
/// returns the reply to send back.
pub type Handler = Arc<dyn Fn(&[Frame]) -> Frame + Send + Sync>;

/// Maps upper-case command names to their handlers.
///
/// The registry is filled once before the server starts and is only read afterwards, so it
/// is shared between connections without locking.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Registry {
        Self::default()
    }

    /// Registers `handler` under `name`. Names are case insensitive, registering the same
    /// name twice replaces the previous handler.
    pub fn register<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&[Frame]) -> Frame + Send + Sync + 'static,
    {
        self.handlers
            .insert(name.to_ascii_uppercase(), Arc::new(handler));
        self
    }

    /// Looks up a handler by its upper-case name.
    pub fn lookup(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("commands", &names).finish()
    }
}
