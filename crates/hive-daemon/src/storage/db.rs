//! Database connection and initialization.

pub use hive_core::db::DatabaseError;

hive_core::define_database!(Database, "Session store migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }
}
