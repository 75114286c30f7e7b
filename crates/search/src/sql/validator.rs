//! Contract checks for generated SQL
//!
//! Runs independently of the generator. A statement is `Safe` only if it
//! parses (Postgres dialect) to exactly one query and passes every token
//! level rule below; otherwise it is `Rejected` with the first violation.

use super::SafetyClass;
use coursewise_common::catalog::TableDescriptor;
use coursewise_common::metrics::record_sql_rejection;
use regex_lite::Regex;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace, Word};
use std::fmt;
use std::sync::OnceLock;
use tracing::warn;

const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "COPY", "INTO", "CALL", "DO", "LOCK", "VACUUM", "REFRESH",
];

/// Functions that write state when called from a SELECT
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    "SETVAL", "NEXTVAL", "SET_CONFIG", "PG_TERMINATE_BACKEND", "PG_CANCEL_BACKEND",
    "PG_RELOAD_CONF", "PG_ADVISORY_LOCK", "PG_ADVISORY_XACT_LOCK", "DBLINK", "DBLINK_EXEC",
    "PG_READ_FILE", "PG_SLEEP",
];

/// Large-object functions (`lo_import`, `lo_unlink`, ...)
const SIDE_EFFECT_PREFIXES: &[&str] = &["LO_"];

const CLOCK_FUNCTIONS: &[&str] = &[
    "NOW", "CURRENT_DATE", "CURRENT_TIMESTAMP", "CURRENT_TIME", "LOCALTIME", "LOCALTIMESTAMP",
    "CURDATE", "SYSDATE",
];

const PARTIAL_MATCH: &[&str] = &["LIKE", "ILIKE", "SIMILAR"];

const AGGREGATES: &[&str] = &["AVG", "SUM", "MIN", "MAX", "COUNT"];

/// Identifiers that must appear double-quoted when used as columns
const RESERVED_COLUMNS: &[&str] = &["YEAR", "RANK", "AVG"];

/// Keywords that must be followed by BY unless quoted
const RESERVED_CLAUSES: &[&str] = &["ORDER", "GROUP"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Violation {
    checker: &'static str,
    detail: String,
}

impl Violation {
    fn new(checker: &'static str, detail: impl Into<String>) -> Self {
        Self {
            checker,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.checker, self.detail)
    }
}

/// Ranking and bound cues found in the sub-question
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankingCues {
    pub descending: bool,
    pub ascending: bool,
    pub bound: bool,
}

impl RankingCues {
    pub fn detect(subquery: &str) -> Self {
        let text = subquery.to_lowercase();
        Self {
            descending: descending_cue().is_match(&text),
            ascending: ascending_cue().is_match(&text),
            bound: bound_cue().is_match(&text),
        }
    }

    pub fn any(&self) -> bool {
        self.descending || self.ascending || self.bound
    }
}

fn descending_cue() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(highest|top|maximum|max|best|most|largest|greatest)\b|הכי גבוה|הגבוה|מקסימ|הכי טוב|הטוב ביותר")
            .expect("descending cue pattern")
    })
}

fn ascending_cue() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(lowest|minimum|min|worst|least|smallest|bottom)\b|הכי נמוך|הנמוך|מינימ|הכי גרוע")
            .expect("ascending cue pattern")
    })
}

fn bound_cue() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(first|last|limit|rank|ranking|ranked|sort|sorted|order|ordered)\b|\b\d+\s+(courses|lecturers|results|years)\b|דירוג|מיין|ממוין|ראשונ")
            .expect("bound cue pattern")
    })
}

/// Classify `sql` generated for `subquery` over `table`
pub fn check(sql: &str, subquery: &str, table: &TableDescriptor) -> SafetyClass {
    match check_contract(sql, subquery, table) {
        Ok(()) => SafetyClass::Safe,
        Err(violation) => {
            warn!(checker = violation.checker, detail = %violation.detail, sql = %sql, "Generated SQL rejected");
            record_sql_rejection(violation.checker);
            SafetyClass::Rejected {
                reason: violation.to_string(),
            }
        }
    }
}

fn check_contract(sql: &str, subquery: &str, table: &TableDescriptor) -> Result<(), Violation> {
    let dialect = PostgreSqlDialect {};

    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| Violation::new("syntax", e.to_string()))?;
    check_comments(&tokens)?;

    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();
    check_keywords(&significant)?;

    let statements = Parser::parse_sql(&dialect, sql).map_err(|e| Violation::new("syntax", e.to_string()))?;
    if statements.len() != 1 {
        return Err(Violation::new(
            "statement_count",
            format!("expected one statement, found {}", statements.len()),
        ));
    }
    check_statement(&statements[0])?;

    check_aggregates(&significant, table)?;
    check_ordering(&significant, RankingCues::detect(subquery))?;
    Ok(())
}

fn check_statement(statement: &Statement) -> Result<(), Violation> {
    let Statement::Query(query) = statement else {
        return Err(Violation::new("not_select", "statement is not a query"));
    };
    if let SetExpr::Select(select) = query.body.as_ref() {
        if select.into.is_some() {
            return Err(Violation::new("write_statement", "SELECT INTO creates a table"));
        }
    }
    Ok(())
}

fn check_comments(tokens: &[Token]) -> Result<(), Violation> {
    for token in tokens {
        match token {
            Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                return Err(Violation::new("comment", "comments are not allowed"));
            }
            Token::Word(_) | Token::SingleQuotedString(_) | Token::Whitespace(_) => {}
            other if other.to_string().starts_with('#') => {
                return Err(Violation::new("comment", "'#' is not allowed"));
            }
            _ => {}
        }
    }
    Ok(())
}

fn unquoted(token: &Token) -> Option<String> {
    match token {
        Token::Word(Word {
            value,
            quote_style: None,
            ..
        }) => Some(value.to_ascii_uppercase()),
        _ => None,
    }
}

fn is_word(token: Option<&&Token>, upper: &str) -> bool {
    token.and_then(|t| unquoted(t)).as_deref() == Some(upper)
}

fn check_keywords(tokens: &[&Token]) -> Result<(), Violation> {
    for (idx, token) in tokens.iter().enumerate() {
        let Some(word) = unquoted(token) else {
            continue;
        };
        let next = tokens.get(idx + 1);

        if WRITE_KEYWORDS.contains(&word.as_str()) {
            return Err(Violation::new("write_statement", format!("{} is not allowed", word)));
        }
        if matches!(next, Some(Token::LParen))
            && (SIDE_EFFECT_FUNCTIONS.contains(&word.as_str())
                || SIDE_EFFECT_PREFIXES.iter().any(|p| word.starts_with(p)))
        {
            return Err(Violation::new(
                "side_effect_function",
                format!("{}() writes server state", word.to_lowercase()),
            ));
        }
        if CLOCK_FUNCTIONS.contains(&word.as_str()) {
            return Err(Violation::new("wall_clock", format!("{} refers to system time", word)));
        }
        if PARTIAL_MATCH.contains(&word.as_str()) {
            return Err(Violation::new("partial_match", format!("{} is not exact equality", word)));
        }
        if RESERVED_COLUMNS.contains(&word.as_str()) && !matches!(next, Some(Token::LParen)) {
            return Err(Violation::new(
                "unescaped_identifier",
                format!("\"{}\" must be double-quoted", word.to_lowercase()),
            ));
        }
        if RESERVED_CLAUSES.contains(&word.as_str()) && !is_word(next, "BY") {
            return Err(Violation::new(
                "unescaped_identifier",
                format!("\"{}\" must be double-quoted", word.to_lowercase()),
            ));
        }
    }
    Ok(())
}

fn check_aggregates(tokens: &[&Token], table: &TableDescriptor) -> Result<(), Violation> {
    let pre_aggregated: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| c.pre_aggregated)
        .map(|c| c.name.as_str())
        .collect();
    if pre_aggregated.is_empty() {
        return Ok(());
    }

    for (idx, token) in tokens.iter().enumerate() {
        let Some(function) = unquoted(token) else {
            continue;
        };
        if !AGGREGATES.contains(&function.as_str()) || !matches!(tokens.get(idx + 1), Some(Token::LParen)) {
            continue;
        }

        let mut depth = 0usize;
        for inner in &tokens[idx + 1..] {
            match inner {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Token::Word(Word { value, .. })
                    if pre_aggregated.iter().any(|c| c.eq_ignore_ascii_case(value)) =>
                {
                    return Err(Violation::new(
                        "aggregate_of_aggregate",
                        format!("{}({}) aggregates a pre-aggregated column", function, value),
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn check_ordering(tokens: &[&Token], cues: RankingCues) -> Result<(), Violation> {
    let order_at = tokens
        .iter()
        .enumerate()
        .position(|(idx, t)| unquoted(t).as_deref() == Some("ORDER") && is_word(tokens.get(idx + 1), "BY"));
    let has_limit = tokens
        .iter()
        .any(|t| matches!(unquoted(t).as_deref(), Some("LIMIT") | Some("FETCH")));

    if order_at.is_none() && !has_limit {
        return Ok(());
    }
    if !cues.any() {
        return Err(Violation::new(
            "unrequested_ordering",
            "ORDER BY/LIMIT without a ranking or bound in the question",
        ));
    }

    let Some(order_at) = order_at else {
        return Ok(());
    };
    let descending = tokens[order_at..]
        .iter()
        .any(|t| unquoted(t).as_deref() == Some("DESC"));

    if cues.descending && !cues.ascending && !descending {
        return Err(Violation::new("ordering_direction", "question asks for the highest values"));
    }
    if cues.ascending && !cues.descending && descending {
        return Err(Violation::new("ordering_direction", "question asks for the lowest values"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursewise_common::catalog::ColumnDescriptor;

    fn grades() -> TableDescriptor {
        let column = |name: &str, pre_aggregated: bool| ColumnDescriptor {
            name: name.to_string(),
            description: String::new(),
            pre_aggregated,
        };
        TableDescriptor {
            name: "grades".into(),
            table_type: "grades".into(),
            description: String::new(),
            columns: vec![
                column("course_name", false),
                column("lecturer", false),
                column("year", false),
                column("semester", false),
                column("avg", true),
            ],
        }
    }

    fn rejected_by(sql: &str, subquery: &str) -> Option<&'static str> {
        check_contract(sql, subquery, &grades()).err().map(|v| v.checker)
    }

    #[test]
    fn test_exact_equality_select_is_safe() {
        let sql = r#"SELECT "avg", lecturer FROM grades WHERE course_name = 'Algorithms'"#;
        assert_eq!(check(sql, "What is the average grade in Algorithms?", &grades()), SafetyClass::Safe);
    }

    #[test]
    fn test_previous_years_uses_max_of_time_column() {
        let sql = r#"SELECT * FROM grades WHERE course_name = 'Algorithms' AND "year" < (SELECT MAX("year") FROM grades WHERE course_name = 'Algorithms')"#;
        assert_eq!(rejected_by(sql, "grades in Algorithms in previous years"), None);
    }

    #[test]
    fn test_non_queries_and_multiple_statements() {
        assert_eq!(rejected_by("DELETE FROM grades", "q"), Some("write_statement"));
        assert_eq!(rejected_by("SELECT * FROM grades; DROP TABLE grades", "q"), Some("write_statement"));
        assert_eq!(
            rejected_by("WITH d AS (DELETE FROM grades RETURNING *) SELECT * FROM d", "q"),
            Some("write_statement")
        );
        assert_eq!(rejected_by("SELECT 1; SELECT 2", "q"), Some("statement_count"));
        assert_eq!(rejected_by("EXPLAIN SELECT * FROM grades", "q"), Some("not_select"));
    }

    #[test]
    fn test_select_into_and_side_effect_functions() {
        assert_eq!(
            rejected_by("SELECT * INTO stolen FROM grades WHERE course_name = 'Algorithms'", "q"),
            Some("write_statement")
        );
        assert_eq!(rejected_by("SELECT setval('grades_id_seq', 1)", "q"), Some("side_effect_function"));
        assert_eq!(rejected_by("SELECT nextval('grades_id_seq')", "q"), Some("side_effect_function"));
        assert_eq!(
            rejected_by("SELECT set_config('search_path', 'x', false)", "q"),
            Some("side_effect_function")
        );
        assert_eq!(rejected_by("SELECT pg_terminate_backend(42)", "q"), Some("side_effect_function"));
        assert_eq!(rejected_by("SELECT lo_unlink(1234)", "q"), Some("side_effect_function"));
        assert_eq!(
            rejected_by("SELECT dblink_exec('db', 'DROP TABLE grades')", "q"),
            Some("side_effect_function")
        );
    }

    #[test]
    fn test_select_into_statement_is_a_write() {
        let parse = |sql: &str| Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap().remove(0);

        let into = check_statement(&parse("SELECT * INTO stolen FROM grades")).unwrap_err();
        assert_eq!(into.checker, "write_statement");
        assert!(check_statement(&parse("SELECT * FROM grades")).is_ok());
    }

    #[test]
    fn test_comments_rejected() {
        assert_eq!(rejected_by("SELECT * FROM grades -- all", "q"), Some("comment"));
        assert_eq!(rejected_by("SELECT /* x */ * FROM grades", "q"), Some("comment"));
    }

    #[test]
    fn test_wall_clock_and_partial_match() {
        assert_eq!(rejected_by(r#"SELECT * FROM grades WHERE "year" = NOW()"#, "q"), Some("wall_clock"));
        assert_eq!(
            rejected_by("SELECT * FROM grades WHERE course_name LIKE '%Alg%'", "q"),
            Some("partial_match")
        );
    }

    #[test]
    fn test_reserved_identifiers_must_be_quoted() {
        assert_eq!(
            rejected_by("SELECT * FROM grades WHERE year = 2024", "grades in 2024"),
            Some("unescaped_identifier")
        );
        assert_eq!(rejected_by(r#"SELECT * FROM grades WHERE "year" = 2024"#, "grades in 2024"), None);
    }

    #[test]
    fn test_no_aggregate_over_pre_aggregated_column() {
        assert_eq!(
            rejected_by(r#"SELECT AVG("avg") FROM grades"#, "average grade"),
            Some("aggregate_of_aggregate")
        );
        assert_eq!(rejected_by("SELECT COUNT(*) FROM grades", "how many courses"), None);
    }

    #[test]
    fn test_ordering_requires_cue_and_direction() {
        let desc = r#"SELECT * FROM grades ORDER BY "avg" DESC LIMIT 1"#;
        let asc = r#"SELECT * FROM grades ORDER BY "avg" ASC LIMIT 1"#;

        assert_eq!(rejected_by(desc, "Which course has the highest average?"), None);
        assert_eq!(rejected_by(desc, "average grade in Algorithms"), Some("unrequested_ordering"));
        assert_eq!(rejected_by(asc, "Which course has the highest average?"), Some("ordering_direction"));
        assert_eq!(rejected_by(asc, "Which course has the lowest average?"), None);
    }

    #[test]
    fn test_cues() {
        assert!(RankingCues::detect("Top 3 courses").descending);
        assert!(RankingCues::detect("הקורס עם הממוצע הכי נמוך").ascending);
        assert!(!RankingCues::detect("average grade in Algorithms").any());
    }

    #[test]
    fn test_rejection_reason_names_checker() {
        match check("SELECT * FROM grades -- x", "q", &grades()) {
            SafetyClass::Rejected { reason } => assert!(reason.starts_with("comment:")),
            SafetyClass::Safe => panic!("expected rejection"),
        }
    }
}
