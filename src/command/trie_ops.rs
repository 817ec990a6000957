//! Data commands running against the session's active database

use std::sync::Arc;

use super::{AccessFlags, Command, CommandRegistry, ResponseShape, BOOL_REPLY, INT_REPLY, MEMBER_ROWS, STRING_REPLY};
use crate::error::Result;
use crate::protocol::{Field, Reply};
use crate::server::Server;
use crate::session::Session;
use crate::trie::Member;

pub(super) fn register(registry: &mut CommandRegistry) -> Result<()> {
    registry.register(Arc::new(Add))?;
    registry.register(Arc::new(Del))?;
    registry.register(Arc::new(Has))?;
    registry.register(Arc::new(HasCount))?;
    registry.register(Arc::new(HasPrefix))?;
    registry.register(Arc::new(Members))?;
    registry.register(Arc::new(PrefixMembers))?;
    registry.register(Arc::new(Tree))?;
    Ok(())
}

fn member_rows(members: Vec<Member>) -> Reply {
    let mut payload = Vec::with_capacity(members.len() * 2);
    for member in members {
        payload.push(Field::text(member.value));
        payload.push(Field::Int(member.count));
    }
    Reply::rows(MEMBER_ROWS.signature.to_vec(), payload)
}

pub struct Add;

impl Command for Add {
    fn name(&self) -> &'static str {
        "ADD"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::WRITE
    }
    fn shape(&self) -> ResponseShape {
        INT_REPLY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "ADD <key>\n\nAdds one reference to <key> and returns its new count."
    }
    fn execute(&self, _: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        let count = session.active_db.store().add(&args[0]);
        Ok(Reply::single(Field::Int(count)))
    }
}

pub struct Del;

impl Command for Del {
    fn name(&self) -> &'static str {
        "DEL"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::WRITE
    }
    fn shape(&self) -> ResponseShape {
        BOOL_REPLY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "DEL <key>\n\nRemoves <key> with all its references. Returns whether it existed."
    }
    fn execute(&self, _: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        let existed = session.active_db.store().delete(&args[0]);
        Ok(Reply::single(Field::Bool(existed)))
    }
}

pub struct Has;

impl Command for Has {
    fn name(&self) -> &'static str {
        "HAS"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::READ
    }
    fn shape(&self) -> ResponseShape {
        BOOL_REPLY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "HAS <key>\n\nReturns whether <key> is a member."
    }
    fn execute(&self, _: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        Ok(Reply::single(Field::Bool(session.active_db.store().has(&args[0]))))
    }
}

pub struct HasCount;

impl Command for HasCount {
    fn name(&self) -> &'static str {
        "HASCOUNT"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::READ
    }
    fn shape(&self) -> ResponseShape {
        INT_REPLY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "HASCOUNT <key>\n\nReturns the reference count of <key>, 0 if it is not a member."
    }
    fn execute(&self, _: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        let (_, count) = session.active_db.store().has_count(&args[0]);
        Ok(Reply::single(Field::Int(count)))
    }
}

pub struct HasPrefix;

impl Command for HasPrefix {
    fn name(&self) -> &'static str {
        "HASPREFIX"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::READ
    }
    fn shape(&self) -> ResponseShape {
        BOOL_REPLY
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "HASPREFIX <prefix>\n\nReturns whether any member starts with <prefix>."
    }
    fn execute(&self, _: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        Ok(Reply::single(Field::Bool(session.active_db.store().has_prefix(&args[0]))))
    }
}

pub struct Members;

impl Command for Members {
    fn name(&self) -> &'static str {
        "MEMBERS"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::READ
    }
    fn shape(&self) -> ResponseShape {
        MEMBER_ROWS
    }
    fn help(&self) -> &'static str {
        "MEMBERS\n\nLists every member with its reference count, in key order."
    }
    fn execute(&self, _: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        Ok(member_rows(session.active_db.store().members()))
    }
}

pub struct PrefixMembers;

impl Command for PrefixMembers {
    fn name(&self) -> &'static str {
        "PREFIXMEMBERS"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::READ
    }
    fn shape(&self) -> ResponseShape {
        MEMBER_ROWS
    }
    fn arity(&self) -> usize {
        1
    }
    fn help(&self) -> &'static str {
        "PREFIXMEMBERS <prefix>\n\nLists the members starting with <prefix> with their reference counts."
    }
    fn execute(&self, _: &Server, session: &mut Session, args: &[String]) -> Result<Reply> {
        Ok(member_rows(session.active_db.store().prefix_members(&args[0])))
    }
}

pub struct Tree;

impl Command for Tree {
    fn name(&self) -> &'static str {
        "TREE"
    }
    fn flags(&self) -> AccessFlags {
        AccessFlags::READ
    }
    fn shape(&self) -> ResponseShape {
        STRING_REPLY
    }
    fn help(&self) -> &'static str {
        "TREE\n\nPrints the trie of the active database."
    }
    fn execute(&self, _: &Server, session: &mut Session, _: &[String]) -> Result<Reply> {
        Ok(Reply::single(Field::text(session.active_db.store().dump())))
    }
}
