pub mod models;

use models::{Conversation, StoredMessage};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result};

pub struct Database {
    pub conn: Mutex<Connection>,
}

impl Database {
    pub fn new(app_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(app_dir).ok();
        let db_path = app_dir.join("hafa-chat.db");
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                sources TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    // ── Conversations ──

    /// Swap the whole cached list for a fresh server listing.
    pub fn replace_conversations(&self, conversations: &[Conversation]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let keep: Vec<&str> = conversations.iter().map(|c| c.id.as_str()).collect();
            let mut existing = tx.prepare("SELECT id FROM conversations")?;
            let stale: Vec<String> = existing
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|id| id.ok())
                .filter(|id| !keep.contains(&id.as_str()))
                .collect();
            for id in stale {
                tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            }
            for conv in conversations {
                upsert(&tx, conv)?;
            }
        }
        tx.commit()
    }

    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.lock();
        upsert(&conn, conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, title, created_at, updated_at, message_count FROM conversations WHERE id = ?1",
            params![id],
            conversation_from_row,
        )
        .optional()
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at, message_count FROM conversations ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], conversation_from_row)?;
        rows.collect()
    }

    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn update_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        Ok(())
    }

    // ── Messages ──

    pub fn replace_messages(&self, conversation_id: &str, messages: &[StoredMessage]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        for msg in messages {
            let sources = serde_json::to_string(&msg.sources).unwrap_or_else(|_| "[]".into());
            tx.execute(
                "INSERT OR REPLACE INTO messages (id, conversation_id, role, content, sources, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![msg.id, conversation_id, msg.role, msg.content, sources, msg.created_at],
            )?;
        }
        tx.commit()
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, sources, created_at FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            let sources: String = row.get(4)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                sources: serde_json::from_str(&sources).unwrap_or_default(),
                created_at: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn upsert(conn: &Connection, conv: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, title, created_at, updated_at, message_count)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            updated_at = excluded.updated_at,
            message_count = excluded.message_count",
        params![
            conv.id,
            conv.title,
            conv.created_at,
            conv.updated_at,
            conv.message_count
        ],
    )?;
    Ok(())
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        message_count: row.get(4)?,
    })
}
