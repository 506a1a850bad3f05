use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// One persisted alert event.
#[derive(Clone, Debug, Serialize)]
pub struct AlertRecord {
    pub student_id: String,
    pub direction: String,
    /// Server-side insertion time, epoch seconds.
    pub alert_time: i64,
    /// Full client payload, persisted verbatim.
    pub details: serde_json::Value,
}

pub trait ProctorStore {
    fn insert_alert(&mut self, record: &AlertRecord) -> Result<()>;

    /// Alerts ordered newest first.
    fn list_alerts(&mut self, limit: usize) -> Result<Vec<AlertRecord>>;

    fn add_student(&mut self, username: &str, roll_number: &str, password_hash: &str)
        -> Result<()>;

    /// Parameterized credential lookup; true when a row matches all three.
    fn verify_credentials(
        &mut self,
        username: &str,
        roll_number: &str,
        password_hash: &str,
    ) -> Result<bool>;

    fn student_count(&mut self) -> Result<u64>;

    fn alert_count(&mut self) -> Result<u64>;
}

pub struct SqliteProctorStore {
    conn: Connection,
}

impl SqliteProctorStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS students (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL,
              roll_number TEXT NOT NULL UNIQUE,
              password_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              student_id TEXT NOT NULL,
              direction TEXT NOT NULL,
              alert_time INTEGER NOT NULL,
              details_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_time ON alerts(alert_time);
            "#,
        )?;
        Ok(())
    }
}

impl ProctorStore for SqliteProctorStore {
    fn insert_alert(&mut self, record: &AlertRecord) -> Result<()> {
        let details_json = serde_json::to_string(&record.details)?;
        self.conn.execute(
            r#"
            INSERT INTO alerts(student_id, direction, alert_time, details_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.student_id,
                record.direction,
                record.alert_time,
                details_json
            ],
        )?;
        Ok(())
    }

    fn list_alerts(&mut self, limit: usize) -> Result<Vec<AlertRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT student_id, direction, alert_time, details_json
            FROM alerts
            ORDER BY alert_time DESC, id DESC
            LIMIT ?1
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let details_json: String = row.get(3)?;
            out.push(AlertRecord {
                student_id: row.get(0)?,
                direction: row.get(1)?,
                alert_time: row.get(2)?,
                details: serde_json::from_str(&details_json)?,
            });
        }
        Ok(out)
    }

    fn add_student(
        &mut self,
        username: &str,
        roll_number: &str,
        password_hash: &str,
    ) -> Result<()> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO students(username, roll_number, password_hash)
            VALUES (?1, ?2, ?3)
            "#,
            params![username, roll_number, password_hash],
        )?;
        if inserted == 0 {
            return Err(anyhow!("roll number '{}' already exists", roll_number));
        }
        Ok(())
    }

    fn verify_credentials(
        &mut self,
        username: &str,
        roll_number: &str,
        password_hash: &str,
    ) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                r#"
                SELECT id FROM students
                WHERE username = ?1 AND roll_number = ?2 AND password_hash = ?3
                "#,
                params![username, roll_number, password_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn student_count(&mut self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn alert_count(&mut self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[derive(Clone, Debug, Default)]
struct InMemoryStudent {
    username: String,
    roll_number: String,
    password_hash: String,
}

#[derive(Debug, Default)]
pub struct InMemoryProctorStore {
    alerts: Vec<AlertRecord>,
    students: Vec<InMemoryStudent>,
}

impl InMemoryProctorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProctorStore for InMemoryProctorStore {
    fn insert_alert(&mut self, record: &AlertRecord) -> Result<()> {
        self.alerts.push(record.clone());
        Ok(())
    }

    fn list_alerts(&mut self, limit: usize) -> Result<Vec<AlertRecord>> {
        let mut out = self.alerts.clone();
        out.reverse();
        out.sort_by(|a, b| b.alert_time.cmp(&a.alert_time));
        out.truncate(limit);
        Ok(out)
    }

    fn add_student(
        &mut self,
        username: &str,
        roll_number: &str,
        password_hash: &str,
    ) -> Result<()> {
        if self
            .students
            .iter()
            .any(|s| s.roll_number == roll_number)
        {
            return Err(anyhow!("roll number '{}' already exists", roll_number));
        }
        self.students.push(InMemoryStudent {
            username: username.to_string(),
            roll_number: roll_number.to_string(),
            password_hash: password_hash.to_string(),
        });
        Ok(())
    }

    fn verify_credentials(
        &mut self,
        username: &str,
        roll_number: &str,
        password_hash: &str,
    ) -> Result<bool> {
        Ok(self.students.iter().any(|s| {
            s.username == username
                && s.roll_number == roll_number
                && s.password_hash == password_hash
        }))
    }

    fn student_count(&mut self) -> Result<u64> {
        Ok(self.students.len() as u64)
    }

    fn alert_count(&mut self) -> Result<u64> {
        Ok(self.alerts.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_password;
    use serde_json::json;

    fn alert(student: &str, direction: &str, time: i64) -> AlertRecord {
        AlertRecord {
            student_id: student.to_string(),
            direction: direction.to_string(),
            alert_time: time,
            details: json!({"student_id": student, "direction": direction}),
        }
    }

    fn exercise_store(store: &mut dyn ProctorStore) {
        assert_eq!(store.alert_count().unwrap(), 0);

        store.insert_alert(&alert("42", "ALERT: Looking Left", 100)).unwrap();
        store.insert_alert(&alert("42", "ALERT: Looking Right", 300)).unwrap();
        store.insert_alert(&alert("7", "ALERT: Looking Down", 200)).unwrap();

        let alerts = store.list_alerts(10).unwrap();
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].direction, "ALERT: Looking Right");
        assert_eq!(alerts[1].direction, "ALERT: Looking Down");
        assert_eq!(alerts[2].direction, "ALERT: Looking Left");
        assert_eq!(alerts[0].details["student_id"], "42");

        assert_eq!(store.list_alerts(1).unwrap().len(), 1);

        let hash = hash_password("pw");
        store.add_student("ada", "42", &hash).unwrap();
        assert!(store.add_student("ada", "42", &hash).is_err());
        assert_eq!(store.student_count().unwrap(), 1);

        assert!(store.verify_credentials("ada", "42", &hash).unwrap());
        assert!(!store
            .verify_credentials("ada", "42", &hash_password("wrong"))
            .unwrap());
        assert!(!store.verify_credentials("eve", "42", &hash).unwrap());
    }

    #[test]
    fn sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("proctor.db");
        let mut store = SqliteProctorStore::open(db_path.to_str().unwrap()).unwrap();
        exercise_store(&mut store);
    }

    #[test]
    fn in_memory_store_roundtrip() {
        let mut store = InMemoryProctorStore::new();
        exercise_store(&mut store);
    }

    #[test]
    fn sqlite_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("proctor.db");
        {
            let mut store = SqliteProctorStore::open(db_path.to_str().unwrap()).unwrap();
            store.insert_alert(&alert("42", "ALERT: Looking Up", 50)).unwrap();
        }
        let mut store = SqliteProctorStore::open(db_path.to_str().unwrap()).unwrap();
        assert_eq!(store.alert_count().unwrap(), 1);
    }
}
