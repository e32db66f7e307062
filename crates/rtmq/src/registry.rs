// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application message dispatch table.
//!
//! Handlers are registered before launch and the finished registry is
//! shared immutably (`Arc`) by every worker, so dispatch is a plain
//! `HashMap` lookup with no lock. One handler per message type; an
//! unhandled type is counted as a drop by the worker, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Callback invoked with `(msg_type, origin_node, body)`.
pub type Handler = Arc<dyn Fn(u16, i32, &[u8]) -> Result<()> + Send + Sync>;

pub struct HandlerRegistry {
    handlers: HashMap<u16, Handler>,
    type_max: u16,
}

impl HandlerRegistry {
    /// Registry accepting message types in `[0, type_max)`.
    pub fn new(type_max: u16) -> Self {
        Self {
            handlers: HashMap::new(),
            type_max,
        }
    }

    /// Bind a handler to `msg_type`. Rejects out-of-range types and
    /// double registration.
    pub fn register<F>(&mut self, msg_type: u16, handler: F) -> Result<()>
    where
        F: Fn(u16, i32, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        if msg_type >= self.type_max {
            return Err(Error::InvalidType(msg_type));
        }
        if self.handlers.contains_key(&msg_type) {
            return Err(Error::DuplicateHandler(msg_type));
        }
        self.handlers.insert(msg_type, Arc::new(handler));
        Ok(())
    }

    /// Handler bound to `msg_type`, if any.
    pub fn lookup(&self, msg_type: u16) -> Option<&Handler> {
        self.handlers.get(&msg_type)
    }

    pub fn type_max(&self) -> u16 {
        self.type_max
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("type_max", &self.type_max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_register_and_dispatch() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);

        let mut reg = HandlerRegistry::new(0xFF);
        reg.register(0x20, move |msg_type, origin, body| {
            assert_eq!(msg_type, 0x20);
            assert_eq!(origin, 42);
            assert_eq!(body, b"ping");
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

        let h = reg.lookup(0x20).unwrap();
        h(0x20, 42, b"ping").unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(reg.lookup(0x21).is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut reg = HandlerRegistry::new(0xFF);
        reg.register(0x20, |_, _, _| Ok(())).unwrap();
        assert!(matches!(
            reg.register(0x20, |_, _, _| Ok(())),
            Err(Error::DuplicateHandler(0x20))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_out_of_range_type_rejected() {
        let mut reg = HandlerRegistry::new(0x10);
        assert!(matches!(
            reg.register(0x10, |_, _, _| Ok(())),
            Err(Error::InvalidType(0x10))
        ));
        assert!(reg.register(0x0F, |_, _, _| Ok(())).is_ok());
    }
}
