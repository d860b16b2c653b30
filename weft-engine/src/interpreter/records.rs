//! Record statements
//!
//! Every mutation goes through the same three steps: structural rejection
//! (parallel task, function body), the mutation policy gate, then the store.
//! A denied mutation never reaches the store. `find` is a read and skips the
//! gate.

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::evaluator::evaluate_at;
use crate::store::RecordChange;
use crate::trace::ExecutionStep;
use weft::ir::{Expression, FieldExprs, Span};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

fn record_values(value: Value, record: &str, action: &str, span: Span) -> RuntimeResult<ValueMap> {
    match value {
        Value::Map(map) => Ok(map),
        other => Err(RuntimeError::domain(build_guidance_message(
            &format!("Cannot {} {}: values must be an object.", action, record),
            &format!("The values evaluated to {}.", other.kind_name()),
            "Pass an object with the record fields.",
            &format!("{} \"{}\" with {{ name is \"Ada\" }}", action, record),
        ))
        .at(span)),
    }
}

impl Engine {
    fn ensure_record_mutation_allowed(
        &self,
        ctx: &mut ExecutionContext,
        action: &str,
        record: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        if ctx.parallel_mode {
            return Err(RuntimeError::fatal("Parallel tasks cannot change records").at(span));
        }
        if ctx.in_function() {
            return Err(RuntimeError::fatal("Functions cannot change records").at(span));
        }
        let decision = self.evaluate_mutation_policy(ctx, action, record, span)?;
        if !decision.allowed {
            log::info!(
                "Mutation {} {} denied: {:?}",
                action,
                record,
                decision.reason_code
            );
            return Err(decision.to_error(span));
        }
        Ok(())
    }

    fn evaluate_fields(
        &self,
        ctx: &mut ExecutionContext,
        fields: &FieldExprs,
        span: Span,
    ) -> RuntimeResult<ValueMap> {
        let mut map = ValueMap::new();
        for (name, expr) in fields {
            let value = evaluate_at(self, ctx, expr, span)?;
            map.insert(name.clone(), value);
        }
        Ok(map)
    }

    fn apply_changes(&self, ctx: &mut ExecutionContext, kind: &str, record: &str, changes: Vec<RecordChange>, span: Span) {
        ctx.record_step(
            ExecutionStep::new(kind, format!("{} {}", kind.trim_start_matches("statement_"), record), span)
                .because(format!("{} record(s) changed", changes.len())),
        );
        ctx.record_changes.extend(changes);
    }

    pub(crate) fn execute_save(
        &self,
        ctx: &mut ExecutionContext,
        record: &str,
        values: Option<&Expression>,
        span: Span,
    ) -> RuntimeResult<()> {
        self.ensure_record_mutation_allowed(ctx, "save", record, span)?;
        let value = match values {
            Some(expr) => evaluate_at(self, ctx, expr, span)?,
            None => ctx.state.get(record).cloned().unwrap_or(Value::Null),
        };
        let values = record_values(value, record, "save", span)?;
        let change = ctx.store.save(record, values).map_err(|e| e.at(span))?;
        ctx.last_value = change.after.clone().unwrap_or(Value::Null);
        self.apply_changes(ctx, "statement_save", record, vec![change], span);
        Ok(())
    }

    pub(crate) fn execute_create(
        &self,
        ctx: &mut ExecutionContext,
        record: &str,
        values: &Expression,
        target: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        self.ensure_record_mutation_allowed(ctx, "create", record, span)?;
        let value = evaluate_at(self, ctx, values, span)?;
        let values = record_values(value, record, "create", span)?;
        let change = ctx.store.create(record, values).map_err(|e| e.at(span))?;
        let created = change.after.clone().unwrap_or(Value::Null);
        ctx.locals.insert(target.to_string(), created.clone());
        ctx.last_value = created;
        self.apply_changes(ctx, "statement_create", record, vec![change], span);
        Ok(())
    }

    pub(crate) fn execute_find(
        &self,
        ctx: &mut ExecutionContext,
        record: &str,
        filter: &FieldExprs,
        target: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        let filter = self.evaluate_fields(ctx, filter, span)?;
        let rows = ctx.store.find(record, &filter).map_err(|e| e.at(span))?;
        ctx.record_step(ExecutionStep::new("statement_find", format!("find {}", record), span)
            .because(format!("{} row(s) matched", rows.len())));
        let rows = Value::List(rows);
        ctx.locals.insert(target.to_string(), rows.clone());
        ctx.last_value = rows;
        Ok(())
    }

    pub(crate) fn execute_update(
        &self,
        ctx: &mut ExecutionContext,
        record: &str,
        filter: &FieldExprs,
        updates: &FieldExprs,
        span: Span,
    ) -> RuntimeResult<()> {
        self.ensure_record_mutation_allowed(ctx, "update", record, span)?;
        let filter = self.evaluate_fields(ctx, filter, span)?;
        let updates = self.evaluate_fields(ctx, updates, span)?;
        let changes = ctx.store.update(record, &filter, &updates).map_err(|e| e.at(span))?;
        ctx.last_value = Value::Integer(changes.len() as i64);
        self.apply_changes(ctx, "statement_update", record, changes, span);
        Ok(())
    }

    pub(crate) fn execute_delete(
        &self,
        ctx: &mut ExecutionContext,
        record: &str,
        filter: &FieldExprs,
        span: Span,
    ) -> RuntimeResult<()> {
        self.ensure_record_mutation_allowed(ctx, "delete", record, span)?;
        let filter = self.evaluate_fields(ctx, filter, span)?;
        let changes = ctx.store.delete(record, &filter).map_err(|e| e.at(span))?;
        ctx.last_value = Value::Integer(changes.len() as i64);
        self.apply_changes(ctx, "statement_delete", record, changes, span);
        Ok(())
    }
}
