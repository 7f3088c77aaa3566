//! The reserved default text store: string-keyed convenience storage with
//! optional expiry, injected when the connection is opened with
//! `use_text_store`.

use chrono::Utc;
use polydb_common::{record, DbError, Key, Result, Value};

use crate::connection::{Storage, TEXT_STORE_NAME};

impl Storage {
    fn check_text_store(&self) -> Result<()> {
        if self.get_schema().has_store(TEXT_STORE_NAME) {
            Ok(())
        } else {
            Err(DbError::Constraint(
                "default text store is not enabled on this connection".into(),
            ))
        }
    }

    /// Store a value under a string key, optionally expiring after
    /// `expiration_ms` milliseconds.
    pub async fn set_item(
        &self,
        key: &str,
        value: Value,
        expiration_ms: Option<u64>,
    ) -> Result<()> {
        self.check_text_store()?;
        let expires_at = expiration_ms
            .map(|ms| Utc::now().timestamp_millis() + ms as i64)
            .unwrap_or(0);
        let entry = record! { "value" => value, "expiresAt" => expires_at };
        self.put_with_key(TEXT_STORE_NAME, entry, Key::text(key))
            .await?;
        Ok(())
    }

    /// Fetch a value by string key. Expired entries read as absent.
    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        self.check_text_store()?;
        let Some(entry) = self.get(TEXT_STORE_NAME, Key::text(key)).await? else {
            return Ok(None);
        };
        let expires_at = entry
            .get_path("expiresAt")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if expires_at > 0.0 && (Utc::now().timestamp_millis() as f64) > expires_at {
            return Ok(None);
        }
        Ok(entry.get_path("value").cloned())
    }

    /// Delete a value by string key.
    pub async fn remove_item(&self, key: &str) -> Result<u64> {
        self.check_text_store()?;
        self.remove(TEXT_STORE_NAME, Key::text(key)).await
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StorageOptions;
    use crate::connection::Storage;
    use polydb_common::schema::DatabaseSchema;
    use polydb_common::Value;

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let storage = Storage::open(
            "text",
            DatabaseSchema::default(),
            StorageOptions::default().with_text_store(),
        )
        .unwrap();
        storage.wait_ready().await.unwrap();

        storage
            .set_item("greeting", Value::Text("hi".into()), None)
            .await
            .unwrap();
        assert_eq!(
            storage.get_item("greeting").await.unwrap(),
            Some(Value::Text("hi".into()))
        );

        assert_eq!(storage.remove_item("greeting").await.unwrap(), 1);
        assert_eq!(storage.get_item("greeting").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let storage = Storage::open(
            "text",
            DatabaseSchema::default(),
            StorageOptions::default().with_text_store(),
        )
        .unwrap();
        storage.wait_ready().await.unwrap();

        // Already expired: a zero-millisecond lifetime is in the past by
        // the time the read happens.
        storage
            .set_item("ephemeral", Value::Text("gone".into()), Some(0))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(storage.get_item("ephemeral").await.unwrap(), None);

        storage
            .set_item("durable", Value::Text("kept".into()), Some(60_000))
            .await
            .unwrap();
        assert_eq!(
            storage.get_item("durable").await.unwrap(),
            Some(Value::Text("kept".into()))
        );
    }

    #[tokio::test]
    async fn disabled_text_store_is_a_constraint_error() {
        let storage = Storage::open(
            "no-text",
            DatabaseSchema::default(),
            StorageOptions::default(),
        )
        .unwrap();
        storage.wait_ready().await.unwrap();

        let err = storage.get_item("anything").await.unwrap_err();
        assert_eq!(err.kind(), "constraint_error");
    }
}
