//! Device account row: owner ids plus the pickled Olm account.

use rusqlite::OptionalExtension;

use crate::error::CryptoError;
use crate::storage::CryptoStore;
use crate::util::now_secs;

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub user_id: String,
    pub device_id: String,
    pub pickle: String,
    pub keys_uploaded: bool,
}

impl CryptoStore<'_> {
    /// Insert the account, or replace the pickle of the existing one.
    pub fn store_account(
        &self,
        user_id: &str,
        device_id: &str,
        pickle: &str,
    ) -> Result<(), CryptoError> {
        let now = now_secs();
        self.conn.execute(
            "INSERT INTO crypto_account (id, user_id, device_id, pickle, created_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET pickle = excluded.pickle,
                                           updated_at = excluded.updated_at",
            rusqlite::params![user_id, device_id, pickle, now],
        )?;
        Ok(())
    }

    pub fn update_account_pickle(&self, pickle: &str) -> Result<(), CryptoError> {
        let updated = self.conn.execute(
            "UPDATE crypto_account SET pickle = ?1, updated_at = ?2 WHERE id = 1",
            rusqlite::params![pickle, now_secs()],
        )?;
        if updated == 0 {
            return Err(CryptoError::IdentityNotInitialized);
        }
        Ok(())
    }

    pub fn load_account(&self) -> Result<AccountRow, CryptoError> {
        self.conn
            .query_row(
                "SELECT user_id, device_id, pickle, keys_uploaded FROM crypto_account WHERE id = 1",
                [],
                |row| {
                    Ok(AccountRow {
                        user_id: row.get(0)?,
                        device_id: row.get(1)?,
                        pickle: row.get(2)?,
                        keys_uploaded: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or(CryptoError::IdentityNotInitialized)
    }

    pub fn has_account(&self) -> Result<bool, CryptoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_account WHERE id = 1",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn set_keys_uploaded(&self, uploaded: bool) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_account SET keys_uploaded = ?1 WHERE id = 1",
            [uploaded],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CryptoError;
    use crate::storage::{init_test_db, CryptoStore};

    #[test]
    fn load_account_on_empty_db_is_not_initialized() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        assert!(matches!(
            store.load_account(),
            Err(CryptoError::IdentityNotInitialized)
        ));
        assert!(!store.has_account().unwrap());
    }

    #[test]
    fn store_then_load_account() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        store.store_account("@a:hs", "DEV", "{\"p\":1}").unwrap();
        let row = store.load_account().unwrap();
        assert_eq!(row.user_id, "@a:hs");
        assert_eq!(row.device_id, "DEV");
        assert_eq!(row.pickle, "{\"p\":1}");
        assert!(!row.keys_uploaded);
    }

    #[test]
    fn update_pickle_keeps_ids() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        store.store_account("@a:hs", "DEV", "one").unwrap();
        store.update_account_pickle("two").unwrap();
        store.set_keys_uploaded(true).unwrap();
        let row = store.load_account().unwrap();
        assert_eq!(row.pickle, "two");
        assert_eq!(row.device_id, "DEV");
        assert!(row.keys_uploaded);
    }

    #[test]
    fn update_pickle_without_account_fails() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        assert!(matches!(
            store.update_account_pickle("x"),
            Err(CryptoError::IdentityNotInitialized)
        ));
    }
}
