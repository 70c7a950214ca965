//! Index naming: each database has one `latest` index holding the current
//! state of every record and a fixed set of `arc` indices sharing its
//! historical states.

/// Number of archive indices per database.
pub const ARC_COUNT: usize = 5;

pub fn latest_index(database: &str) -> String {
    format!("data-{database}-latest")
}

/// The arc index a record's history belongs to, assigned by summing the
/// bytes of its id so the assignment is stable across runs and processes.
pub fn arc_index(database: &str, record_id: &str) -> String {
    let arc: usize = record_id.bytes().map(usize::from).sum::<usize>() % ARC_COUNT;
    format!("data-{database}-arc-{arc:03}")
}

/// Every index a database's documents can land in.
pub fn all_indices(database: &str) -> Vec<String> {
    let mut indices = vec![latest_index(database)];
    for arc in 0..ARC_COUNT {
        indices.push(format!("data-{database}-arc-{arc:03}"));
    }
    indices
}

pub fn arc_indices(database: &str) -> Vec<String> {
    (0..ARC_COUNT)
        .map(|arc| format!("data-{database}-arc-{arc:03}"))
        .collect()
}

pub fn template_name(database: &str) -> String {
    format!("data-{database}")
}

pub fn index_pattern(database: &str) -> String {
    format!("data-{database}-*")
}

/// The search document id for one version of a record.
pub fn document_id(record_id: &str, version: i64) -> String {
    format!("{record_id}:{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_assignment_is_stable_and_bounded() {
        // 'r' + '1' = 114 + 49 = 163, 163 % 5 = 3
        assert_eq!(arc_index("db", "r1"), "data-db-arc-003");
        assert_eq!(arc_index("db", "r1"), arc_index("db", "r1"));
        for id in ["a", "zz", "some-much-longer-id", ""] {
            let name = arc_index("db", id);
            assert!(name.starts_with("data-db-arc-0"));
        }
    }

    #[test]
    fn a_database_has_latest_plus_arcs() {
        let indices = all_indices("db");
        assert_eq!(indices.len(), 1 + ARC_COUNT);
        assert_eq!(indices[0], "data-db-latest");
        assert_eq!(indices[1], "data-db-arc-000");
        assert_eq!(indices[ARC_COUNT], "data-db-arc-004");
    }

    #[test]
    fn document_ids_join_record_and_version() {
        assert_eq!(document_id("r1", 1672531200000), "r1:1672531200000");
    }
}
