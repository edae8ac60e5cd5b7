//! Cross-store semantic validation, run after record-state accumulation and
//! before command extraction. Failures abort the transaction before any
//! bytes reach the log.

use crate::error::{Result, StoreError};
use crate::lock::{Resource, ResourceLocker};
use crate::schema::{EntityKind, TokenRegistry};
use crate::txn::command::Command;
use crate::txn::state::TransactionRecordState;
use crate::types::{KernelVersion, TokenKind};

pub struct IntegrityValidator<'a> {
    tokens: &'a TokenRegistry,
}

impl<'a> IntegrityValidator<'a> {
    pub fn new(tokens: &'a TokenRegistry) -> Self {
        Self { tokens }
    }

    /// Pre-extraction checks over the staged record state.
    pub fn validate(&self, state: &mut TransactionRecordState<'_>) -> Result<()> {
        for node in state.deleted_node_ids() {
            if state.node_has_relationships_after(node)? {
                return Err(StoreError::Validation(format!(
                    "Cannot delete node {node} because it still has relationships"
                )));
            }
        }
        self.validate_schema_rules(state)
    }

    fn validate_schema_rules(&self, state: &TransactionRecordState<'_>) -> Result<()> {
        for rule in state.created_schema_rules() {
            if rule.keys.is_empty() {
                return Err(StoreError::Constraint(format!(
                    "schema rule {} has no property keys",
                    rule.id.0
                )));
            }
            let (token_kind, token_name) = match rule.entity {
                EntityKind::Node => (TokenKind::Label, "label"),
                EntityKind::Relationship => (TokenKind::RelType, "relationship type"),
            };
            if !self.tokens.contains(token_kind, rule.entity_token)
                && !state.token_staged(token_kind, rule.entity_token)
            {
                return Err(StoreError::Constraint(format!(
                    "schema rule {} references unknown {token_name} {}",
                    rule.id.0, rule.entity_token
                )));
            }
            for key in &rule.keys {
                if !self.tokens.contains(TokenKind::PropertyKey, key.0)
                    && !state.token_staged(TokenKind::PropertyKey, key.0)
                {
                    return Err(StoreError::Constraint(format!(
                        "schema rule {} references unknown property key {}",
                        rule.id.0, key.0
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An upgrade command must move strictly forward between recognised
/// versions.
pub fn validate_upgrade(current: KernelVersion, target: KernelVersion) -> Result<()> {
    if target <= current {
        return Err(StoreError::Validation(format!(
            "cannot upgrade from {current} to {target}"
        )));
    }
    Ok(())
}

/// Optional cross-check that every record mutated by the transaction is
/// covered by a held exclusive lock.
pub fn verify_sufficiently_locked(
    commands: &[Command],
    locks: &dyn ResourceLocker,
) -> Result<()> {
    for command in commands {
        let resource = match command {
            Command::Node(pair) => Some(Resource::Node(pair.id())),
            Command::Relationship(pair) => Some(Resource::Relationship(pair.id())),
            Command::Schema { .. } => Some(Resource::Schema),
            _ => None,
        };
        if let Some(resource) = resource {
            if !locks.holds_exclusive(resource) {
                return Err(StoreError::Corruption(format!(
                    "{} command for {resource:?} is not covered by a held lock",
                    command.kind_name()
                )));
            }
        }
    }
    Ok(())
}
