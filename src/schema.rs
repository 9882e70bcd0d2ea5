use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static NON_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-z0-9]+").unwrap_or_else(|err| panic!("invalid identifier pattern: {err}"))
});
static UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_+").unwrap_or_else(|err| panic!("invalid pattern: {err}")));

pub fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let replaced = NON_IDENT.replace_all(&lowered, "_");
    let trimmed = replaced.trim_matches('_');
    UNDERSCORES.replace_all(trimmed, "_").into_owned()
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn claim_unique(taken: &mut HashSet<String>, candidate: &str) -> String {
    if taken.insert(candidate.to_string()) {
        return candidate.to_string();
    }
    let mut n = 2usize;
    loop {
        let name = format!("{candidate}_{n}");
        if taken.insert(name.clone()) {
            return name;
        }
        n += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub raw: String,
    pub canonical: String,
    pub assigned: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    raw: Vec<String>,
    columns: Vec<String>,
    collisions: Vec<Collision>,
}

impl ColumnMapping {
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut taken = HashSet::new();
        let mut raw = Vec::with_capacity(headers.len());
        let mut columns = Vec::with_capacity(headers.len());
        let mut collisions = Vec::new();

        for (idx, header) in headers.iter().enumerate() {
            let header = header.as_ref();
            let header = if idx == 0 {
                header.trim_start_matches('\u{feff}')
            } else {
                header
            };
            let mut canonical = normalize(header);
            if canonical.is_empty() {
                canonical = format!("column_{}", idx + 1);
            }
            let assigned = claim_unique(&mut taken, &canonical);
            if assigned != canonical {
                collisions.push(Collision {
                    raw: header.to_string(),
                    canonical: canonical.clone(),
                    assigned: assigned.clone(),
                });
            }
            raw.push(header.to_string());
            columns.push(assigned);
        }

        Self {
            raw,
            columns,
            collisions,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn raw(&self) -> &[String] {
        &self.raw
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn matches<S: AsRef<str>>(&self, headers: &[S]) -> bool {
        Self::from_headers(headers).columns == self.columns
    }

    pub fn create_table_sql(&self, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| format!("{} VARCHAR", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE OR REPLACE TABLE {} ({columns})", quote_ident(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_examples() {
        assert_eq!(normalize("Handler ID"), "handler_id");
        assert_eq!(normalize("  Facility--Name (Primary) "), "facility_name_primary");
        assert_eq!(normalize("__already_snake__"), "already_snake");
        assert_eq!(normalize("A__B"), "a_b");
        assert_eq!(normalize("ZIP+4"), "zip_4");
        assert_eq!(normalize("???"), "");
    }

    #[test]
    fn collision_is_reported_and_suffixed() {
        let mapping = ColumnMapping::from_headers(&["Handler ID", "handler_id", "HANDLER-ID"]);
        assert_eq!(
            mapping.columns(),
            &["handler_id", "handler_id_2", "handler_id_3"]
        );
        assert_eq!(mapping.collisions().len(), 2);
        assert_eq!(mapping.collisions()[0].raw, "handler_id");
        assert_eq!(mapping.collisions()[0].assigned, "handler_id_2");
    }

    #[test]
    fn suffix_skips_names_already_present() {
        let mapping = ColumnMapping::from_headers(&["a_2", "A", "a"]);
        assert_eq!(mapping.columns(), &["a_2", "a", "a_3"]);
    }

    #[test]
    fn blank_headers_get_positional_names() {
        let mapping = ColumnMapping::from_headers(&["\u{feff}Id", "", "#"]);
        assert_eq!(mapping.columns(), &["id", "column_2", "column_3"]);
        assert_eq!(mapping.raw(), &["Id", "", "#"]);
    }

    #[test]
    fn create_table_quotes_identifiers() {
        let mapping = ColumnMapping::from_headers(&["Handler ID", "Facility Name"]);
        assert_eq!(
            mapping.create_table_sql("hd_handler"),
            "CREATE OR REPLACE TABLE \"hd_handler\" (\"handler_id\" VARCHAR, \"facility_name\" VARCHAR)"
        );
    }
}
