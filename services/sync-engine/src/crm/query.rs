use chrono::{DateTime, Utc};

use super::models::{OpportunityQuery, OPPORTUNITY_FIELDS};

/// Build the SOQL for one page of opportunities.
///
/// Generates: `SELECT Id, ... FROM Opportunity WHERE LastModifiedDate >= 2026-02-15T00:00:00Z
/// AND StageName IN ('Closed Won') AND Id > '006...' ORDER BY Id ASC LIMIT 200`
pub fn build_opportunity_soql(query: &OpportunityQuery) -> String {
    let mut soql = format!("SELECT {} FROM Opportunity", OPPORTUNITY_FIELDS.join(", "));
    let mut clauses = filter_clauses(query);
    if let Some(after) = &query.after_id {
        clauses.push(format!("Id > {}", quote(after)));
    }
    push_where(&mut soql, &clauses);
    soql.push_str(&format!(" ORDER BY Id ASC LIMIT {}", query.limit));
    soql
}

/// Build the SOQL counting every record the query window matches (cursor ignored).
pub fn build_count_soql(query: &OpportunityQuery) -> String {
    let mut soql = "SELECT COUNT() FROM Opportunity".to_string();
    push_where(&mut soql, &filter_clauses(query));
    soql
}

/// Build the SOQL for a single opportunity by id.
pub fn build_by_id_soql(id: &str) -> String {
    format!(
        "SELECT {} FROM Opportunity WHERE Id = {} LIMIT 1",
        OPPORTUNITY_FIELDS.join(", "),
        quote(id)
    )
}

fn filter_clauses(query: &OpportunityQuery) -> Vec<String> {
    let mut clauses = Vec::new();
    if let Some(since) = query.modified_since {
        clauses.push(format!("LastModifiedDate >= {}", soql_datetime(since)));
    }
    if let Some(until) = query.modified_until {
        clauses.push(format!("LastModifiedDate < {}", soql_datetime(until)));
    }
    if !query.stage_names.is_empty() {
        let stages: Vec<String> = query.stage_names.iter().map(|s| quote(s)).collect();
        clauses.push(format!("StageName IN ({})", stages.join(", ")));
    }
    clauses
}

fn push_where(soql: &mut String, clauses: &[String]) {
    if !clauses.is_empty() {
        soql.push_str(" WHERE ");
        soql.push_str(&clauses.join(" AND "));
    }
}

/// SOQL datetime literals are unquoted UTC ISO-8601.
fn soql_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Quote a SOQL string literal, escaping backslashes and single quotes.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unfiltered_query_has_no_where() {
        let soql = build_opportunity_soql(&OpportunityQuery::default());
        assert!(soql.starts_with("SELECT Id, Name, Amount"));
        assert!(!soql.contains("WHERE"));
        assert!(soql.ends_with("FROM Opportunity ORDER BY Id ASC LIMIT 200"));
    }

    #[test]
    fn window_stage_and_cursor_filters() {
        let query = OpportunityQuery {
            limit: 50,
            modified_since: Some(Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap()),
            modified_until: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap()),
            stage_names: vec!["Closed Won".to_string(), "Negotiation".to_string()],
            after_id: Some("006A".to_string()),
        };
        let soql = build_opportunity_soql(&query);
        assert!(soql.ends_with(
            " WHERE LastModifiedDate >= 2026-02-15T00:00:00Z \
             AND LastModifiedDate < 2026-03-01T12:30:00Z \
             AND StageName IN ('Closed Won', 'Negotiation') \
             AND Id > '006A' ORDER BY Id ASC LIMIT 50"
        ), "got: {soql}");
    }

    #[test]
    fn count_ignores_cursor_and_limit() {
        let query = OpportunityQuery {
            stage_names: vec!["Closed Won".to_string()],
            after_id: Some("006A".to_string()),
            ..OpportunityQuery::default()
        };
        assert_eq!(
            build_count_soql(&query),
            "SELECT COUNT() FROM Opportunity WHERE StageName IN ('Closed Won')"
        );
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(quote("O'Brien \\ Co"), "'O\\'Brien \\\\ Co'");
        let soql = build_by_id_soql("006' OR Id != '");
        assert!(soql.contains("WHERE Id = '006\\' OR Id != \\'' LIMIT 1"), "got: {soql}");
    }
}
