//! Command dispatch table
//!
//! Every command is a [`Command`] trait object registered by name in a
//! [`CommandRegistry`]. The registry is built once per server and never
//! changes afterwards.
//!
//! Handlers return `Result<Reply>`; an `Err` becomes a FAIL reply carrying
//! the error message, so `?` is the normal way to bail out of a command.

mod admin;
mod trie_ops;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TrisError};
use crate::protocol::{FieldType, Reply};
use crate::server::Server;
use crate::session::Session;

// ============================================================================
// Metadata
// ============================================================================

/// Access class of a command.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags(u8);

impl AccessFlags {
    pub const READ: AccessFlags = AccessFlags(0b001);
    /// A successful execution counts as one write on the active database.
    pub const WRITE: AccessFlags = AccessFlags(0b010);
    pub const ADMIN: AccessFlags = AccessFlags(0b100);

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [(Self::READ, "READ"), (Self::WRITE, "WRITE"), (Self::ADMIN, "ADMIN")] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        write!(f, "{}", names.join("|"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Empty,
    Single,
    Multi,
}

/// Declared reply layout of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseShape {
    pub kind: ResponseKind,
    pub signature: &'static [FieldType],
}

impl ResponseShape {
    pub const EMPTY: ResponseShape = ResponseShape { kind: ResponseKind::Empty, signature: &[] };

    pub const fn single(field: &'static [FieldType]) -> Self {
        ResponseShape { kind: ResponseKind::Single, signature: field }
    }

    pub const fn multi(signature: &'static [FieldType]) -> Self {
        ResponseShape { kind: ResponseKind::Multi, signature }
    }
}

pub(crate) const STRING_REPLY: ResponseShape = ResponseShape::single(&[FieldType::String]);
pub(crate) const BOOL_REPLY: ResponseShape = ResponseShape::single(&[FieldType::Bool]);
pub(crate) const INT_REPLY: ResponseShape = ResponseShape::single(&[FieldType::Int]);
pub(crate) const MEMBER_ROWS: ResponseShape = ResponseShape::multi(&[FieldType::String, FieldType::Int]);

// ============================================================================
// Command trait
// ============================================================================

pub trait Command: Send + Sync {
    /// Upper-case dispatch key
    fn name(&self) -> &'static str;

    fn flags(&self) -> AccessFlags;

    fn shape(&self) -> ResponseShape;

    /// Number of positional arguments the command requires. Extra
    /// arguments are ignored.
    fn arity(&self) -> usize {
        0
    }

    fn help(&self) -> &'static str;

    fn execute(&self, server: &Server, session: &mut Session, args: &[String]) -> Result<Reply>;
}

/// Check the argument count, then run the command.
pub fn invoke(command: &dyn Command, server: &Server, session: &mut Session, args: &[String]) -> Reply {
    if args.len() < command.arity() {
        let err = TrisError::MissingArgument {
            command: command.name(),
            expected: command.arity(),
            got: args.len(),
        };
        debug!(command = command.name(), code = err.code(), "missing argument");
        return Reply::fail(err.to_string());
    }

    match command.execute(server, session, args) {
        Ok(reply) => reply,
        Err(e) => {
            debug!(command = command.name(), code = e.code(), error = %e, "command failed");
            Reply::fail(e.to_string())
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in command.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        admin::register(&mut registry)?;
        trie_ops::register(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, command: Arc<dyn Command>) -> Result<()> {
        let name = command.name();
        if self.commands.contains_key(name) {
            return Err(TrisError::CommandAlreadyRegistered(name.to_string()));
        }
        self.commands.insert(name, command);
        Ok(())
    }

    /// Exact lookup; callers upper-case the name first.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.commands.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Command for Noop {
        fn name(&self) -> &'static str {
            "NOOP"
        }
        fn flags(&self) -> AccessFlags {
            AccessFlags::READ
        }
        fn shape(&self) -> ResponseShape {
            ResponseShape::EMPTY
        }
        fn help(&self) -> &'static str {
            "NOOP\n\nDoes nothing."
        }
        fn execute(&self, _: &Server, _: &mut Session, _: &[String]) -> Result<Reply> {
            Ok(Reply::empty())
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(Noop)).unwrap();

        let err = registry.register(Arc::new(Noop)).unwrap_err();
        assert_eq!(err.to_string(), "Command NOOP has already been registered.");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_builtin_command_set() {
        let registry = CommandRegistry::builtin().unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "ADD", "CREATE", "DBINFO", "DEL", "EXIT", "HAS", "HASCOUNT", "HASPREFIX", "HELP",
                "IMPORT", "INFO", "MEMBERS", "MERGE", "PING", "PREFIXMEMBERS", "SAVE", "SELECT",
                "SHUTDOWN", "TIMING", "TREE",
            ]
        );
    }

    #[test]
    fn test_only_add_and_del_are_writes() {
        let registry = CommandRegistry::builtin().unwrap();
        let writes: Vec<_> = registry
            .names()
            .into_iter()
            .filter(|n| registry.get(n).unwrap().flags().contains(AccessFlags::WRITE))
            .collect();
        assert_eq!(writes, vec!["ADD", "DEL"]);
    }

    #[test]
    fn test_lookup_is_exact() {
        let registry = CommandRegistry::builtin().unwrap();
        assert!(registry.get("PING").is_some());
        assert!(registry.get("ping").is_none());
        assert!(registry.get("BOGUS").is_none());
    }

    #[test]
    fn test_declared_shapes() {
        let registry = CommandRegistry::builtin().unwrap();
        assert_eq!(registry.get("MEMBERS").unwrap().shape(), MEMBER_ROWS);
        assert_eq!(registry.get("HASCOUNT").unwrap().shape(), INT_REPLY);
        assert_eq!(registry.get("SELECT").unwrap().shape(), ResponseShape::EMPTY);
        assert_eq!(registry.get("IMPORT").unwrap().arity(), 2);
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", AccessFlags::WRITE), "WRITE");
        assert_eq!(format!("{:?}", AccessFlags(0b101)), "READ|ADMIN");
    }
}
