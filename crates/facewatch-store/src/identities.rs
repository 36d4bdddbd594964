//! Identity registration and listing.

use chrono::{DateTime, Utc};
use facewatch_core::{
    DuplicateGuard, Embedding, EngineSettings, IdentityStore, KnownIdentity, ProviderError,
};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::store::{parse_time, SqliteStore};

/// An identity as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub embeddings: usize,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredFace {
    pub identity: String,
    pub embedding_id: i64,
    /// Reference embeddings the identity now has.
    pub embeddings: usize,
}

impl SqliteStore {
    /// Add one reference embedding for `name`, creating the identity if needed.
    ///
    /// Rejects degenerate embeddings and faces that are already registered
    /// (under any identity) within the configured duplicate threshold.
    pub fn register_face(&self, name: &str, embedding: &Embedding) -> Result<RegisteredFace> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        embedding.validate()?;
        if embedding.is_degenerate() {
            return Err(StoreError::DegenerateEmbedding);
        }

        let settings = EngineSettings::load(self)?;

        // Scan and insert under one lock so concurrent registrations of the
        // same face cannot both pass the duplicate check.
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let registered = list_active(&tx)?;
        let guard = DuplicateGuard::new(settings.duplicate_threshold);
        let pairs = registered.iter().flat_map(|identity| {
            identity
                .embeddings
                .iter()
                .map(move |e| (identity.name.as_str(), e))
        });
        let check = guard.check(embedding, pairs)?;
        if check.is_duplicate {
            let identity = check.identity.unwrap_or_default();
            tracing::warn!(
                name,
                existing = %identity,
                confidence = check.confidence,
                "registration rejected as duplicate"
            );
            return Err(StoreError::DuplicateFace {
                identity,
                confidence: check.confidence,
            });
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO identities (name, is_active, created_at, updated_at) VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(name) DO UPDATE SET is_active = 1, updated_at = excluded.updated_at",
            params![name, now],
        )?;
        let identity_id: i64 = tx.query_row(
            "SELECT id FROM identities WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO face_embeddings (identity_id, embedding, dimension, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity_id,
                serde_json::to_string(embedding)?,
                embedding.len() as i64,
                now
            ],
        )?;
        let embedding_id = tx.last_insert_rowid();
        let embeddings = count_embeddings(&tx, identity_id)?;
        tx.commit()?;

        tracing::info!(name, embedding_id, embeddings, "face registered");
        Ok(RegisteredFace {
            identity: name.to_string(),
            embedding_id,
            embeddings,
        })
    }

    /// Delete an identity with all of its embeddings.
    pub fn remove_identity(&self, name: &str) -> Result<()> {
        let removed = self
            .conn()?
            .execute("DELETE FROM identities WHERE name = ?1", params![name])?;
        if removed == 0 {
            return Err(StoreError::UnknownIdentity(name.to_string()));
        }
        tracing::info!(name, "identity removed");
        Ok(())
    }

    /// Exclude (or re-include) an identity from matching without deleting it.
    pub fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE identities SET is_active = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, active, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownIdentity(name.to_string()));
        }
        tracing::info!(name, active, "identity activation changed");
        Ok(())
    }

    pub fn identity_summaries(&self) -> Result<Vec<IdentitySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT i.name, i.is_active, i.created_at, COUNT(e.id)
             FROM identities i
             LEFT JOIN face_embeddings e ON e.identity_id = i.id
             GROUP BY i.id
             ORDER BY i.name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (name, active, created_at, count) = row?;
            summaries.push(IdentitySummary {
                name,
                embeddings: count as usize,
                active,
                created_at: parse_time(&created_at)?,
            });
        }
        Ok(summaries)
    }
}

/// Active identities ordered by name, embeddings in registration order.
///
/// Embeddings that fail to decode are skipped with a warning.
fn list_active(conn: &Connection) -> Result<Vec<KnownIdentity>> {
    let mut stmt = conn.prepare(
        "SELECT i.name, e.id, e.embedding
         FROM identities i
         JOIN face_embeddings e ON e.identity_id = i.id
         WHERE i.is_active = 1
         ORDER BY i.name, e.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut identities: Vec<KnownIdentity> = Vec::new();
    for row in rows {
        let (name, embedding_id, raw) = row?;
        let embedding: Embedding = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(identity = %name, embedding_id, error = %e, "skipping undecodable embedding");
                continue;
            }
        };
        match identities.last_mut() {
            Some(last) if last.name == name => last.embeddings.push(embedding),
            _ => identities.push(KnownIdentity::new(name, vec![embedding])),
        }
    }
    Ok(identities)
}

fn count_embeddings(conn: &Connection, identity_id: i64) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM face_embeddings WHERE identity_id = ?1",
        params![identity_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

impl IdentityStore for SqliteStore {
    fn list_identities(&self) -> std::result::Result<Vec<KnownIdentity>, ProviderError> {
        let conn = self.conn()?;
        let identities = list_active(&conn)?;
        tracing::debug!(count = identities.len(), "identities listed");
        Ok(identities)
    }
}
