//! Statement validation.
//!
//! Every statement passes through a lexical allow-list before it reaches a
//! connection. Analysis runs on [sqlparser](https://docs.rs/sqlparser/) tokens,
//! so keywords inside string literals, quoted identifiers and comments never
//! trigger a rule. Block comments that MySQL executes (`/*! ... */`) or reads
//! as optimizer hints (`/*+ ... */`) are rejected outright. Strict mode additionally requires the statement to parse
//! into an AST whose class agrees with the declared intent.

use crate::error::{DbError, DbResult};
use crate::models::StatementRequest;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::fmt;
use tracing::debug;

/// Words that destroy or re-permission objects.
const DESTRUCTIVE: &[&str] = &["DROP", "ALTER", "TRUNCATE", "RENAME", "PURGE", "GRANT", "REVOKE"];

/// Words that modify data or run opaque code.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "CALL", "EXEC", "EXECUTE",
];

/// Words followed by a table (or view) name.
const TABLE_INTRODUCERS: &[&str] = &["FROM", "JOIN", "INTO", "UPDATE", "TABLE", "VIEW"];

/// Rule that rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionRule {
    Empty,
    Malformed,
    ExecutableComment,
    MultipleStatements,
    Destructive,
    ReadOnlyViolation,
    MissingTableReference,
    StrictParse,
    StrictClass,
}

impl RejectionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Malformed => "malformed",
            Self::ExecutableComment => "executable_comment",
            Self::MultipleStatements => "multiple_statements",
            Self::Destructive => "destructive",
            Self::ReadOnlyViolation => "read_only_violation",
            Self::MissingTableReference => "missing_table_reference",
            Self::StrictParse => "strict_parse",
            Self::StrictClass => "strict_class",
        }
    }
}

impl fmt::Display for RejectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Statement may run. `tables` lists the referenced table names in order.
    Pass { tables: Vec<String> },
    Reject { rule: RejectionRule, reason: String },
}

impl Verdict {
    fn reject(rule: RejectionRule, reason: impl Into<String>) -> Self {
        Verdict::Reject {
            rule,
            reason: reason.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass { .. })
    }

    pub fn rule(&self) -> Option<RejectionRule> {
        match self {
            Verdict::Pass { .. } => None,
            Verdict::Reject { rule, .. } => Some(*rule),
        }
    }

    /// Convert into the referenced tables or a `ValidationRejected` error.
    pub fn into_result(self) -> DbResult<Vec<String>> {
        match self {
            Verdict::Pass { tables } => Ok(tables),
            Verdict::Reject { rule, reason } => Err(DbError::validation(rule.as_str(), reason)),
        }
    }
}

/// Type of SQL statement, as seen by the AST parser in strict mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStatementType {
    /// SELECT and other read-only queries (SELECT, SHOW, EXPLAIN of a query)
    Select,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    DmlWrite,
    /// CREATE, DROP, ALTER, TRUNCATE, COMMENT
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// CALL, EXECUTE, PREPARE
    ProcedureCall,
    /// GRANT, REVOKE, SET, LOCK, VACUUM, ...
    Administrative,
    Unknown,
}

/// Lexical statement validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementValidator {
    strict: bool,
}

impl StatementValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Validate a request. The verdict is final for this request.
    pub fn validate(&self, request: &StatementRequest) -> Verdict {
        let verdict = self.check(request);
        if let Verdict::Reject { rule, reason } = &verdict {
            debug!(rule = %rule, reason = %reason, caller = ?request.caller, "Statement rejected");
        }
        verdict
    }

    fn check(&self, request: &StatementRequest) -> Verdict {
        let sql = request.query.trim();
        if sql.is_empty() {
            return Verdict::reject(RejectionRule::Empty, "empty statement");
        }

        let dialect = GenericDialect {};
        let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => {
                return Verdict::reject(RejectionRule::Malformed, format!("malformed statement: {e}"));
            }
        };

        if tokens.iter().any(is_executable_comment) {
            return Verdict::reject(
                RejectionRule::ExecutableComment,
                "executable and hint comments (/*! */, /*+ */) are not accepted",
            );
        }

        let tokens = significant(tokens);
        if tokens.is_empty() {
            return Verdict::reject(RejectionRule::Empty, "statement contains only comments");
        }
        if tokens.iter().any(|t| matches!(t, Token::SemiColon)) {
            return Verdict::reject(
                RejectionRule::MultipleStatements,
                "only a single statement is accepted per request",
            );
        }

        let words: Vec<Option<String>> = tokens.iter().map(keyword).collect();

        if !request.elevated {
            if let Some(word) = words
                .iter()
                .flatten()
                .find(|w| DESTRUCTIVE.contains(&w.as_str()))
            {
                return Verdict::reject(
                    RejectionRule::Destructive,
                    format!("destructive statement rejected: {word} requires elevated privileges"),
                );
            }
        }

        if request.read_only {
            let first = words.first().cloned().flatten().unwrap_or_default();
            if first != "SELECT" && first != "WITH" {
                return Verdict::reject(
                    RejectionRule::ReadOnlyViolation,
                    format!(
                        "read-only request must start with SELECT or WITH, found '{}'",
                        if first.is_empty() { "?" } else { first.as_str() }
                    ),
                );
            }
            for (idx, word) in words.iter().enumerate() {
                let Some(word) = word else { continue };
                if !WRITE_KEYWORDS.contains(&word.as_str()) || is_for_update(&words, idx) {
                    continue;
                }
                return Verdict::reject(
                    RejectionRule::ReadOnlyViolation,
                    format!("{word} is not allowed in a read-only request"),
                );
            }
        }

        let tables = table_references(&tokens, &words);
        if tables.is_empty() {
            return Verdict::reject(
                RejectionRule::MissingTableReference,
                "statement must reference a table (FROM, JOIN, INTO, UPDATE, TABLE or VIEW)",
            );
        }

        if self.strict {
            if let Some(rejection) = strict_check(sql, request) {
                return rejection;
            }
        }

        Verdict::Pass { tables }
    }
}

/// Drop whitespace and comments.
fn significant(tokens: Vec<Token>) -> Vec<Token> {
    let mut tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();
    // A single trailing terminator is not a second statement
    while matches!(tokens.last(), Some(Token::SemiColon)) {
        tokens.pop();
    }
    tokens
}

fn is_executable_comment(token: &Token) -> bool {
    matches!(
        token,
        Token::Whitespace(Whitespace::MultiLineComment(body)) if body.starts_with('!') || body.starts_with('+')
    )
}

/// Upper-cased unquoted word, if the token is one.
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_ascii_uppercase()),
        _ => None,
    }
}

fn is_for_update(words: &[Option<String>], idx: usize) -> bool {
    words[idx].as_deref() == Some("UPDATE")
        && idx > 0
        && words[idx - 1].as_deref() == Some("FOR")
}

/// Identifiers following a table-introducing keyword, dotted parts joined.
fn table_references(tokens: &[Token], words: &[Option<String>]) -> Vec<String> {
    let mut tables = Vec::new();
    for (idx, word) in words.iter().enumerate() {
        let Some(word) = word else { continue };
        if !TABLE_INTRODUCERS.contains(&word.as_str()) || is_for_update(words, idx) {
            continue;
        }

        let mut pos = idx + 1;
        while matches!(words.get(pos), Some(Some(w)) if w == "ONLY" || w == "IF" || w == "NOT" || w == "EXISTS")
        {
            pos += 1;
        }

        let mut name = Vec::new();
        while let Some(Token::Word(w)) = tokens.get(pos) {
            if w.quote_style.is_none() && w.value.eq_ignore_ascii_case("SELECT") {
                break;
            }
            name.push(w.value.clone());
            if matches!(tokens.get(pos + 1), Some(Token::Period)) {
                pos += 2;
            } else {
                break;
            }
        }
        if !name.is_empty() {
            tables.push(name.join("."));
        }
    }
    tables
}

fn strict_check(sql: &str, request: &StatementRequest) -> Option<Verdict> {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            return Some(Verdict::reject(
                RejectionRule::StrictParse,
                format!("statement does not parse: {e}"),
            ));
        }
    };
    let [statement] = statements.as_slice() else {
        return Some(Verdict::reject(
            RejectionRule::StrictParse,
            "expected exactly one parsed statement",
        ));
    };

    let (class, name) = classify_statement(statement);
    let allowed = match class {
        SqlStatementType::Select => true,
        _ if request.read_only => false,
        SqlStatementType::DmlWrite => true,
        SqlStatementType::Ddl | SqlStatementType::Administrative | SqlStatementType::ProcedureCall => {
            request.elevated
        }
        SqlStatementType::Transaction | SqlStatementType::Unknown => false,
    };

    (!allowed).then(|| {
        Verdict::reject(
            RejectionRule::StrictClass,
            format!("{name} statements are not permitted for this request"),
        )
    })
}

/// Classify a parsed statement into a statement type.
pub fn classify_statement(stmt: &Statement) -> (SqlStatementType, &'static str) {
    use SqlStatementType::*;

    match stmt {
        Statement::Query(_) => (Select, "SELECT"),
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. } => (Select, "SHOW"),

        // EXPLAIN takes the class of what it explains
        Statement::Explain { statement, .. } => match classify_statement(statement) {
            (Select, _) => (Select, "EXPLAIN"),
            other => other,
        },

        Statement::Insert(_) => (DmlWrite, "INSERT"),
        Statement::Update { .. } => (DmlWrite, "UPDATE"),
        Statement::Delete(_) => (DmlWrite, "DELETE"),
        Statement::Merge { .. } => (DmlWrite, "MERGE"),
        Statement::Copy { .. } => (DmlWrite, "COPY"),

        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateTrigger { .. }
        | Statement::CreateRole { .. } => (Ddl, "CREATE"),
        Statement::AlterTable { .. }
        | Statement::AlterView { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterSchema { .. }
        | Statement::AlterRole { .. }
        | Statement::AlterType { .. } => (Ddl, "ALTER"),
        Statement::Drop { .. }
        | Statement::DropFunction { .. }
        | Statement::DropProcedure { .. }
        | Statement::DropTrigger { .. } => (Ddl, "DROP"),
        Statement::Truncate { .. } => (Ddl, "TRUNCATE"),
        Statement::Comment { .. } => (Ddl, "COMMENT"),

        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => (Transaction, "transaction control"),

        Statement::Call { .. } => (ProcedureCall, "CALL"),
        Statement::Execute { .. } | Statement::Prepare { .. } | Statement::Deallocate { .. } => {
            (ProcedureCall, "EXECUTE")
        }

        Statement::Grant { .. } => (Administrative, "GRANT"),
        Statement::Revoke { .. } => (Administrative, "REVOKE"),
        Statement::Set(_)
        | Statement::Use(_)
        | Statement::Kill { .. }
        | Statement::Vacuum { .. }
        | Statement::Analyze { .. }
        | Statement::LockTables { .. }
        | Statement::UnlockTables
        | Statement::Flush { .. }
        | Statement::Pragma { .. }
        | Statement::AttachDatabase { .. } => (Administrative, "administrative"),

        _ => (Unknown, "unrecognized"),
    }
}
