//! SQL generation from a sub-question and a table schema

use coursewise_common::catalog::TableDescriptor;
use coursewise_common::errors::{AppError, Result};
use coursewise_common::llm::LanguageModel;
use std::sync::Arc;
use tracing::debug;

/// Language-model backed SQL generator
pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Generate one SELECT statement answering `subquery` over `table`.
    ///
    /// The text is returned as produced, minus surrounding whitespace and a
    /// single trailing semicolon; contract checks happen separately.
    pub async fn generate(&self, subquery: &str, table: &TableDescriptor) -> Result<String> {
        let prompt = build_prompt(subquery, table);
        let response = self.model.complete(&prompt).await?;

        let sql = response.trim();
        let sql = sql.strip_suffix(';').unwrap_or(sql).trim_end();
        if sql.is_empty() {
            return Err(AppError::parse("sql_generator", "empty completion"));
        }

        debug!(model = self.model.model_name(), table = %table.name, sql = %sql, "SQL generated");
        Ok(sql.to_string())
    }
}

fn build_prompt(subquery: &str, table: &TableDescriptor) -> String {
    let pre_aggregated: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| c.pre_aggregated)
        .map(|c| c.name.as_str())
        .collect();
    let pre_aggregated = if pre_aggregated.is_empty() {
        "(none)".to_string()
    } else {
        pre_aggregated.join(", ")
    };

    format!(
        r#"You are an expert SQL generator for an academic database.
Convert the natural-language question (Hebrew or English) into one precise, safe PostgreSQL query.

TABLE SCHEMA:
Table name: {name}
Table type: {table_type}
Columns:
{columns}
Columns that already hold aggregated values: {pre_aggregated}

RULES:
1. Generate exactly ONE SELECT statement. No comments, no explanations, no multiple queries.
2. Escape reserved identifiers with double quotes: "year", "rank", "avg".
3. Use SELECT * unless the question asks for specific fields.
4. Apply aggregate functions only when explicitly requested.
   NEVER aggregate a column that already holds an aggregated value (e.g. no AVG("avg")).
5. Use ORDER BY and LIMIT only when the question asks for a ranking or a bound.
   "highest", "top", "maximum" -> ORDER BY ... DESC; "lowest", "minimum" -> ORDER BY ... ASC.
6. Match named entities (course names, lecturer names) with exact equality, never LIKE.
   Add WHERE clauses only for filters the question specifies.
7. NEVER use NOW(), CURRENT_DATE, CURRENT_TIMESTAMP or any system time.
   "previous years" means "year" < (SELECT MAX("year") FROM {name} WHERE <same filters>).
8. Never generate INSERT, UPDATE, DELETE, DROP or ALTER.

QUESTION:
"{subquery}"

Return ONLY the SQL query."#,
        name = table.name,
        table_type = table.table_type,
        columns = table.columns_prompt(),
        pre_aggregated = pre_aggregated,
        subquery = subquery,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursewise_common::catalog::ColumnDescriptor;
    use coursewise_common::llm::MockLanguageModel;

    fn grades() -> TableDescriptor {
        TableDescriptor {
            name: "grades".into(),
            table_type: "grades".into(),
            description: String::new(),
            columns: vec![
                ColumnDescriptor {
                    name: "course_name".into(),
                    description: "course name".into(),
                    pre_aggregated: false,
                },
                ColumnDescriptor {
                    name: "avg".into(),
                    description: "average final grade".into(),
                    pre_aggregated: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_generate_trims_terminator() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response("  SELECT * FROM grades WHERE course_name = 'Algorithms';\n");
        let generator = SqlGenerator::new(model.clone());

        let sql = generator.generate("average grade in Algorithms", &grades()).await.unwrap();
        assert_eq!(sql, "SELECT * FROM grades WHERE course_name = 'Algorithms'");

        let prompt = &model.prompts()[0];
        assert!(prompt.contains("- avg: average final grade"));
        assert!(prompt.contains("already hold aggregated values: avg"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_parse_error() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_response(" ; ");
        let err = SqlGenerator::new(model).generate("q", &grades()).await.unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }
}
