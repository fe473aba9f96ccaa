//! SQL security validation.
//!
//! Every generated statement is parsed with the PostgreSQL dialect and policy
//! checked before it can reach a connection: single statement only, SELECT
//! (or WITH ... SELECT) shape, no blocked functions, no blocked tables, and
//! optionally a table allow-list. The validator holds no mutable state, so
//! one instance is shared by all in-flight requests.

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::config::SecurityConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::ValidationResult;

/// Stateless policy validator for generated SQL.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    config: SecurityConfig,
    blocked_functions: HashSet<String>,
    blocked_tables: HashSet<String>,
    /// Instance-level allow-list override; falls back to the config's list.
    allowed_tables: Option<HashSet<String>>,
}

impl SqlValidator {
    pub fn new(config: SecurityConfig) -> Self {
        let blocked_functions = config
            .blocked_functions
            .iter()
            .map(|f| f.to_lowercase())
            .collect();
        let blocked_tables = config
            .blocked_tables
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        let allowed_tables = config
            .allowed_tables
            .as_ref()
            .map(|tables| tables.iter().map(|t| t.to_lowercase()).collect());
        Self {
            config,
            blocked_functions,
            blocked_tables,
            allowed_tables,
        }
    }

    /// A validator scoped to a narrower table allow-list than the config's.
    #[must_use]
    pub fn with_allowed_tables(mut self, tables: &[String]) -> Self {
        self.allowed_tables = Some(tables.iter().map(|t| t.to_lowercase()).collect());
        self
    }

    /// Validates without raising; the result carries the rejection reason.
    pub fn validate(&self, sql: &str) -> (bool, ValidationResult) {
        let (result, _) = self.analyze(sql);
        (result.is_valid, result)
    }

    /// Validates and returns the typed error on rejection.
    pub fn validate_or_raise(&self, sql: &str) -> GatewayResult<ValidationResult> {
        let (result, error) = self.analyze(sql);
        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    fn analyze(&self, sql: &str) -> (ValidationResult, Option<GatewayError>) {
        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(statements) => statements,
            Err(err) => {
                return rejected(
                    GatewayError::sql_parse_error(format!("Failed to parse SQL: {err}")),
                    false,
                    false,
                    Vec::new(),
                );
            }
        };

        let statement = match statements.as_slice() {
            [] => {
                return rejected(
                    GatewayError::sql_parse_error("No SQL statement found"),
                    false,
                    false,
                    Vec::new(),
                );
            }
            [single] => single,
            _ => {
                return rejected(
                    GatewayError::security_violation("Multiple statements are not allowed")
                        .with_detail("statement_count", statements.len()),
                    false,
                    false,
                    Vec::new(),
                );
            }
        };

        // Statement shape policy first, then the content checks (blocked
        // functions, table allow-list) over the whole tree.
        let shape = match self.check_statement_shape(statement) {
            Ok(shape) => shape,
            Err(err) => return rejected(err, false, false, Vec::new()),
        };

        let mut walker = StatementWalker::new(&self.blocked_functions);
        let _: ControlFlow<()> = statement.visit(&mut walker);

        if !walker.used_blocked.is_empty() {
            let names = walker.used_blocked.join(", ");
            let err = GatewayError::security_violation(format!(
                "Query uses blocked functions: {names}"
            ))
            .with_detail("functions", walker.used_blocked.clone());
            return rejected(err, shape.is_select, shape.allows_data_modification, walker.used_blocked);
        }

        // The block-list applies even when no allow-list is configured.
        for table in walker.referenced_tables(|t| self.blocked_tables.contains(t)) {
            let err = GatewayError::security_violation(format!("Table '{table}' is blocked"))
                .with_detail("table", table);
            return rejected(err, shape.is_select, shape.allows_data_modification, Vec::new());
        }

        if let Some(allowed) = self.effective_allowed_tables() {
            for table in walker.referenced_tables(|t| !allowed.contains(t)) {
                let err = GatewayError::security_violation(format!(
                    "Table '{table}' is not in the allowed list"
                ))
                .with_detail("table", table);
                return rejected(err, shape.is_select, shape.allows_data_modification, Vec::new());
            }
        }

        (
            ValidationResult {
                is_valid: true,
                is_select: shape.is_select,
                allows_data_modification: shape.allows_data_modification,
                used_blocked_functions: Vec::new(),
                error: None,
            },
            None,
        )
    }

    fn effective_allowed_tables(&self) -> Option<&HashSet<String>> {
        self.allowed_tables.as_ref()
    }

    fn check_statement_shape(&self, statement: &Statement) -> Result<StatementShape, GatewayError> {
        match statement {
            Statement::Query(query) => {
                if query_is_select(query) {
                    Ok(StatementShape::select())
                } else {
                    // Non-SELECT query bodies (VALUES lists, DML in CTEs) get
                    // the same kind-naming rejection as other statements.
                    let kind = statement_kind(statement);
                    Err(GatewayError::security_violation(format!(
                        "{kind} statements are not allowed"
                    ))
                    .with_detail("statement_kind", kind))
                }
            }
            Statement::Explain { statement, .. } => {
                if !self.config.allow_explain {
                    return Err(GatewayError::security_violation(
                        "EXPLAIN statements are not allowed",
                    ));
                }
                // The explained statement must itself pass the shape policy.
                self.check_statement_shape(statement)
            }
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. } => {
                let kind = statement_kind(statement);
                if self.config.allow_write_operations {
                    Ok(StatementShape::write())
                } else {
                    Err(GatewayError::security_violation(format!(
                        "{kind} statements are not allowed"
                    ))
                    .with_detail("statement_kind", kind))
                }
            }
            other => {
                let kind = statement_kind(other);
                Err(GatewayError::security_violation(format!(
                    "{kind} statements are not allowed"
                ))
                .with_detail("statement_kind", kind))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StatementShape {
    is_select: bool,
    allows_data_modification: bool,
}

impl StatementShape {
    fn select() -> Self {
        Self {
            is_select: true,
            allows_data_modification: false,
        }
    }

    fn write() -> Self {
        Self {
            is_select: false,
            allows_data_modification: true,
        }
    }
}

fn rejected(
    error: GatewayError,
    is_select: bool,
    allows_data_modification: bool,
    used_blocked_functions: Vec<String>,
) -> (ValidationResult, Option<GatewayError>) {
    (
        ValidationResult {
            is_valid: false,
            is_select,
            allows_data_modification,
            used_blocked_functions,
            error: Some(error.message.clone()),
        },
        Some(error),
    )
}

/// True when every leaf of the query's set-expression tree is a SELECT,
/// including inside CTEs. Set operations (UNION etc.) over SELECTs pass;
/// VALUES lists and DML-returning bodies do not.
fn query_is_select(query: &Query) -> bool {
    if let Some(with) = &query.with {
        if !with.cte_tables.iter().all(|cte| query_is_select(&cte.query)) {
            return false;
        }
    }
    body_is_select(&query.body)
}

fn body_is_select(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(_) => true,
        SetExpr::Query(inner) => query_is_select(inner),
        SetExpr::SetOperation { left, right, .. } => body_is_select(left) && body_is_select(right),
        _ => false,
    }
}

/// First keyword of the rendered statement, e.g. `CREATE` for any DDL form.
fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

/// One-pass AST walk collecting referenced tables, CTE names, and blocked
/// function usage.
struct StatementWalker<'a> {
    blocked: &'a HashSet<String>,
    used_blocked: Vec<String>,
    relations: Vec<String>,
    cte_names: HashSet<String>,
}

impl<'a> StatementWalker<'a> {
    fn new(blocked: &'a HashSet<String>) -> Self {
        Self {
            blocked,
            used_blocked: Vec::new(),
            relations: Vec::new(),
            cte_names: HashSet::new(),
        }
    }

    fn record_blocked(&mut self, name: &str) {
        if self.blocked.contains(name) && !self.used_blocked.iter().any(|u| u == name) {
            self.used_blocked.push(name.to_string());
        }
    }

    /// Referenced table names (lowercased, CTE names excluded) matching the
    /// predicate, in first-reference order.
    fn referenced_tables(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        let mut seen = HashSet::new();
        self.relations
            .iter()
            .filter(|name| !self.cte_names.contains(*name))
            .filter(|name| predicate(name))
            .filter(|name| seen.insert((*name).clone()))
            .cloned()
            .collect()
    }
}

impl Visitor for StatementWalker<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(ident) = relation.0.last() {
            let name = ident.value.to_lowercase();
            // Set-returning blocked functions can appear in FROM position.
            self.record_blocked(&name);
            self.relations.push(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            if let Some(ident) = function.name.0.last() {
                let name = ident.value.to_lowercase();
                self.record_blocked(&name);
            }
        }
        ControlFlow::Continue(())
    }
}
