//! ClickHouse SQL rendering for query descriptions

use crate::models::{DATETIME_FORMAT, DATE_FORMAT};

use super::{Expr, GroupKey, Predicate, QueryDescription};

/// Quote a string literal, escaping backslashes and single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl QueryDescription {
    /// Render as a ClickHouse `SELECT` statement
    pub fn to_clickhouse_sql(&self) -> String {
        let time = &self.time_column;

        let select = self
            .select
            .iter()
            .map(|projection| {
                let expr = match &projection.expr {
                    Expr::Date => format!("toDate({})", time),
                    Expr::Bucket => format!("toStartOfFifteenMinutes({})", time),
                    Expr::BucketLabel => {
                        format!("formatDateTime(toStartOfFifteenMinutes({}), '%R')", time)
                    }
                    Expr::Column(expr) | Expr::Formula(expr) => expr.clone(),
                };
                format!("{} AS {}", expr, projection.alias)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let group_by = self
            .group_by
            .iter()
            .map(|key| match key {
                GroupKey::Date => super::DATE_COLUMN.to_string(),
                GroupKey::Bucket => super::BUCKET_COLUMN.to_string(),
                GroupKey::BucketLabel => super::LABEL_COLUMN.to_string(),
                GroupKey::Alias(alias) => alias.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SELECT {} FROM {} WHERE {} GROUP BY {}",
            select,
            self.table,
            render_predicate(&self.filter, time),
            group_by
        )
    }
}

fn render_predicate(predicate: &Predicate, time: &str) -> String {
    match predicate {
        Predicate::All(children) if children.is_empty() => "1".to_string(),
        Predicate::All(children) => children
            .iter()
            .map(|child| render_predicate(child, time))
            .collect::<Vec<_>>()
            .join(" AND "),
        Predicate::Any(children) if children.is_empty() => "0".to_string(),
        Predicate::Any(children) => format!(
            "({})",
            children
                .iter()
                .map(|child| render_predicate(child, time))
                .collect::<Vec<_>>()
                .join(" OR ")
        ),
        Predicate::DateIn(dates) => format!(
            "toDate({}) IN ({})",
            time,
            dates
                .iter()
                .map(|date| quote_literal(&date.format(DATE_FORMAT).to_string()))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Predicate::TimeOfDayFrom(floor) => format!(
            "formatDateTime({}, '%R') >= {}",
            time,
            quote_literal(&floor.format("%H:%M").to_string())
        ),
        Predicate::TimeRange { from, until } => format!(
            "({time} >= {} AND {time} < {})",
            quote_literal(&from.format(DATETIME_FORMAT).to_string()),
            quote_literal(&until.format(DATETIME_FORMAT).to_string()),
        ),
        Predicate::ValueIn { expression, values } => format!(
            "{} IN ({})",
            expression,
            values
                .iter()
                .map(|value| quote_literal(value))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
