//! Contacts and their interaction history.
//!
//! Identity rules: a contact with an email is unique per `(chat_id, email)`;
//! one without is unique per `(chat_id, lower(name))`. Interactions cascade
//! away with their contact.

use rusqlite::{params, OptionalExtension, Row};

use crate::{fts_match_query, now_secs, Store, StoreError};

#[derive(Clone, Debug, Default)]
pub struct NewContact<'a> {
    pub name: &'a str,
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub company: Option<&'a str>,
    pub role: Option<&'a str>,
    pub notes: Option<&'a str>,
    pub photo_path: Option<&'a str>,
    pub source: &'a str,
}

#[derive(Clone, Debug)]
pub struct Contact {
    pub id: i64,
    pub chat_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
    pub notes: Option<String>,
    pub photo_path: Option<String>,
    pub source: String,
    pub first_seen: i64,
    pub last_contact: i64,
    pub interaction_count: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug)]
pub struct Interaction {
    pub id: i64,
    pub chat_id: i64,
    pub contact_id: i64,
    pub kind: String,
    pub source: String,
    pub summary: Option<String>,
    pub date: i64,
    pub created_at: i64,
}

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        role: row.get(6)?,
        notes: row.get(7)?,
        photo_path: row.get(8)?,
        source: row.get(9)?,
        first_seen: row.get(10)?,
        last_contact: row.get(11)?,
        interaction_count: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl Store {
    /// Insert or update a contact, returning its id. Updates overwrite only
    /// the provided fields, bump `interaction_count` and refresh
    /// `last_contact`.
    pub fn upsert_contact(&self, chat_id: i64, contact: &NewContact<'_>) -> Result<i64, StoreError> {
        let now = now_secs();
        self.with_conn(|conn| {
            let existing: Option<i64> = match contact.email {
                Some(email) => conn
                    .query_row(
                        "SELECT id FROM contacts WHERE chat_id = ?1 AND email = ?2",
                        params![chat_id, email],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|err| StoreError::new(format!("contact lookup failed: {err}")))?,
                None => conn
                    .query_row(
                        "SELECT id FROM contacts WHERE chat_id = ?1 AND lower(name) = lower(?2)",
                        params![chat_id, contact.name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|err| StoreError::new(format!("contact lookup failed: {err}")))?,
            };

            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE contacts SET
                             name = ?1,
                             email = COALESCE(?2, email),
                             phone = COALESCE(?3, phone),
                             company = COALESCE(?4, company),
                             role = COALESCE(?5, role),
                             notes = COALESCE(?6, notes),
                             photo_path = COALESCE(?7, photo_path),
                             last_contact = ?8,
                             interaction_count = interaction_count + 1,
                             updated_at = ?8
                         WHERE id = ?9",
                        params![
                            contact.name,
                            contact.email,
                            contact.phone,
                            contact.company,
                            contact.role,
                            contact.notes,
                            contact.photo_path,
                            now,
                            id,
                        ],
                    )
                    .map_err(|err| StoreError::new(format!("contact update failed: {err}")))?;
                    Ok(id)
                }
                None => {
                    conn.execute(
                        "INSERT INTO contacts
                             (chat_id, name, email, phone, company, role, notes, photo_path,
                              source, first_seen, last_contact, interaction_count, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 0, ?10)",
                        params![
                            chat_id,
                            contact.name,
                            contact.email,
                            contact.phone,
                            contact.company,
                            contact.role,
                            contact.notes,
                            contact.photo_path,
                            contact.source,
                            now,
                        ],
                    )
                    .map_err(|err| StoreError::new(format!("contact insert failed: {err}")))?;
                    Ok(conn.last_insert_rowid())
                }
            }
        })
    }

    /// Full-text search over name, email, company, role and notes.
    pub fn search_contacts(
        &self,
        chat_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Contact>, StoreError> {
        let Some(match_expr) = fts_match_query(query) else {
            return Ok(Vec::new());
        };
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id, c.chat_id, c.name, c.email, c.phone, c.company, c.role,
                            c.notes, c.photo_path, c.source, c.first_seen, c.last_contact,
                            c.interaction_count, c.updated_at
                     FROM contacts_fts
                     JOIN contacts c ON c.id = contacts_fts.rowid
                     WHERE contacts_fts MATCH ?1 AND c.chat_id = ?2
                     ORDER BY c.last_contact DESC
                     LIMIT ?3",
                )
                .map_err(|err| StoreError::new(format!("contact search prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![match_expr, chat_id, limit as i64], row_to_contact)
                .map_err(|err| StoreError::new(format!("contact search failed: {err}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| StoreError::new(format!("contact row failed: {err}")))?);
            }
            Ok(out)
        })
    }

    pub fn record_interaction(
        &self,
        chat_id: i64,
        contact_id: i64,
        kind: &str,
        source: &str,
        summary: Option<&str>,
        date: i64,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO interactions
                     (chat_id, contact_id, type, source, summary, date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![chat_id, contact_id, kind, source, summary, date, now_secs()],
            )
            .map_err(|err| StoreError::new(format!("interaction insert failed: {err}")))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn interactions_for_contact(
        &self,
        contact_id: i64,
        limit: usize,
    ) -> Result<Vec<Interaction>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_id, contact_id, type, source, summary, date, created_at
                     FROM interactions
                     WHERE contact_id = ?1
                     ORDER BY date DESC
                     LIMIT ?2",
                )
                .map_err(|err| StoreError::new(format!("interaction prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![contact_id, limit as i64], |row| {
                    Ok(Interaction {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        contact_id: row.get(2)?,
                        kind: row.get(3)?,
                        source: row.get(4)?,
                        summary: row.get(5)?,
                        date: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })
                .map_err(|err| StoreError::new(format!("interaction query failed: {err}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(
                    row.map_err(|err| StoreError::new(format!("interaction row failed: {err}")))?,
                );
            }
            Ok(out)
        })
    }

    pub fn contact_count(&self, chat_id: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM contacts WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count.max(0) as usize)
            .map_err(|err| StoreError::new(format!("contact count failed: {err}")))
        })
    }

    pub fn delete_contact(&self, chat_id: i64, contact_id: i64) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM contacts WHERE id = ?1 AND chat_id = ?2",
                    params![contact_id, chat_id],
                )
                .map_err(|err| StoreError::new(format!("contact delete failed: {err}")))?;
            Ok(changed > 0)
        })
    }
}
