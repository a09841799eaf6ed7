//! Chain metadata repository, the durable tier of the metadata store.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// A stored metadata blob for one chain.
#[derive(Debug, Clone)]
pub struct MetadataRow {
    pub chain_id: String,
    /// Serialized JSON payload.
    pub payload: String,
    pub updated_at: String,
}

/// Inserts or replaces the metadata blob for a chain.
pub fn upsert(db: &Database, row: &MetadataRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO chain_metadata (chain_id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id) DO UPDATE SET
               payload = excluded.payload,
               updated_at = excluded.updated_at",
            params![row.chain_id, row.payload, row.updated_at],
        )?;
        Ok(())
    })
}

/// Finds the metadata blob for a chain.
pub fn find(db: &Database, chain_id: &str) -> Result<Option<MetadataRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT chain_id, payload, updated_at FROM chain_metadata WHERE chain_id = ?1",
                params![chain_id],
                |r| {
                    Ok(MetadataRow {
                        chain_id: r.get(0)?,
                        payload: r.get(1)?,
                        updated_at: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_find() {
        let db = Database::open_in_memory().unwrap();
        upsert(
            &db,
            &MetadataRow {
                chain_id: "chain-1".to_string(),
                payload: r#"{"path":"a.pdf"}"#.to_string(),
                updated_at: "2026-01-01T00:00:00.000Z".to_string(),
            },
        )
        .unwrap();
        upsert(
            &db,
            &MetadataRow {
                chain_id: "chain-1".to_string(),
                payload: r#"{"path":"b.pdf"}"#.to_string(),
                updated_at: "2026-01-01T00:01:00.000Z".to_string(),
            },
        )
        .unwrap();

        let row = find(&db, "chain-1").unwrap().unwrap();
        assert_eq!(row.payload, r#"{"path":"b.pdf"}"#);
        assert_eq!(row.updated_at, "2026-01-01T00:01:00.000Z");
    }

    #[test]
    fn test_find_missing() {
        let db = Database::open_in_memory().unwrap();
        assert!(find(&db, "nope").unwrap().is_none());
    }
}
