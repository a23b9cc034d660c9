use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Review {
    pub user_id: i64,
    pub movie_id: i64,
    pub text: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reminder {
    pub user_id: i64,
    pub movie_id: i64,
    pub remind_time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStats {
    pub favorites: i64,
    pub reviews: i64,
    pub ratings: i64,
    pub reminders: i64,
}

/* ====== Схема ======
   Только аддитивный CREATE TABLE IF NOT EXISTS, без миграций. */
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS movie_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        number INTEGER UNIQUE NOT NULL,
        file_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS favorites (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id BIGINT NOT NULL,
        movie_id INTEGER NOT NULL,
        UNIQUE(user_id, movie_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reviews (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id BIGINT NOT NULL,
        movie_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ratings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id BIGINT NOT NULL,
        movie_id INTEGER NOT NULL,
        stars SMALLINT NOT NULL CHECK (stars BETWEEN 1 AND 5),
        UNIQUE(user_id, movie_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reminders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id BIGINT NOT NULL,
        movie_id INTEGER NOT NULL,
        remind_time TIMESTAMP NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    const DEFAULT_POOL_SIZE: u32 = 5;

    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_pool_size(url, Self::DEFAULT_POOL_SIZE).await
    }

    pub async fn connect_with_pool_size(url: &str, pool_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        info!("store connected: {url} (pool size: {pool_size})");
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        info!("schema ready ({} tables)", SCHEMA.len());
        Ok(())
    }

    /* ====== Кино ====== */

    /// Повторная загрузка того же номера заменяет file_id.
    pub async fn upsert_movie(&self, number: i64, file_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO movie_files (number, file_id)
            VALUES (?, ?)
            ON CONFLICT (number) DO UPDATE SET file_id = excluded.file_id
            "#,
        )
        .bind(number)
        .bind(file_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn movie_file(&self, number: i64) -> Result<Option<String>> {
        let file_id = sqlx::query_scalar::<_, String>(
            r#"
            SELECT file_id FROM movie_files WHERE number = ?
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(file_id)
    }

    pub async fn movie_numbers(&self) -> Result<Vec<i64>> {
        let numbers = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT number FROM movie_files ORDER BY number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(numbers)
    }

    /* ====== Севимлилар ====== */

    /// Переключает отметку, возвращает true если кино теперь в избранном.
    pub async fn toggle_favorite(&self, user_id: i64, movie_id: i64) -> Result<bool> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM favorites WHERE user_id = ? AND movie_id = ?
            "#,
        )
        .bind(user_id)
        .bind(movie_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO favorites (user_id, movie_id)
            VALUES (?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(movie_id)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn favorites(&self, user_id: i64) -> Result<Vec<i64>> {
        let numbers = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT m.number
            FROM favorites f
            JOIN movie_files m ON f.movie_id = m.number
            WHERE f.user_id = ?
            ORDER BY m.number
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(numbers)
    }

    /* ====== Шархлар ====== */

    /// Только добавление; правка и удаление не предусмотрены.
    pub async fn add_review(&self, user_id: i64, movie_id: i64, text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reviews (user_id, movie_id, text)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(movie_id)
        .bind(text)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_reviews(&self, limit: i64) -> Result<Vec<Review>> {
        let reviews = sqlx::query_as::<_, Review>(
            r#"
            SELECT user_id, movie_id, text, created_at
            FROM reviews
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(reviews)
    }

    /* ====== Рейтинг ====== */

    /// Повторная оценка того же пользователя перезаписывает прежнюю.
    pub async fn rate_movie(&self, user_id: i64, movie_id: i64, stars: u8) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ratings (user_id, movie_id, stars)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id, movie_id) DO UPDATE SET stars = excluded.stars
            "#,
        )
        .bind(user_id)
        .bind(movie_id)
        .bind(stars as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn average_rating(&self, movie_id: i64) -> Result<Option<f64>> {
        let avg = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT AVG(stars) FROM ratings WHERE movie_id = ?
            "#,
        )
        .bind(movie_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(avg)
    }

    /* ====== Эслатмалар ====== */

    /// Строки не удаляются после срабатывания: таблица служит журналом.
    pub async fn add_reminder(
        &self,
        user_id: i64,
        movie_id: i64,
        remind_time: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reminders (user_id, movie_id, remind_time)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(movie_id)
        .bind(remind_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Будущие напоминания; на старте по ним заново взводятся таймеры.
    pub async fn pending_reminders(&self, after: NaiveDateTime) -> Result<Vec<Reminder>> {
        let reminders = sqlx::query_as::<_, Reminder>(
            r#"
            SELECT user_id, movie_id, remind_time
            FROM reminders
            WHERE remind_time > ?
            ORDER BY remind_time
            "#,
        )
        .bind(after)
        .fetch_all(&self.pool)
        .await?;

        Ok(reminders)
    }

    /* ====== Статистика ====== */

    pub async fn user_stats(&self, user_id: i64) -> Result<UserStats> {
        Ok(UserStats {
            favorites: self.count("favorites", user_id).await?,
            reviews: self.count("reviews", user_id).await?,
            ratings: self.count("ratings", user_id).await?,
            reminders: self.count("reminders", user_id).await?,
        })
    }

    async fn count(&self, table: &str, user_id: i64) -> Result<i64> {
        // имя таблицы приходит только из user_stats, не из ввода
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {table} WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Local};

    async fn test_store() -> Storage {
        let storage = Storage::connect_with_pool_size("sqlite::memory:", 1)
            .await
            .unwrap();
        storage.init_schema().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let storage = test_store().await;
        storage.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_keeps_latest_handle() {
        let storage = test_store().await;
        storage.upsert_movie(7, "file-a").await.unwrap();
        storage.upsert_movie(7, "file-b").await.unwrap();

        assert_eq!(storage.movie_file(7).await.unwrap().as_deref(), Some("file-b"));
        assert_eq!(storage.movie_numbers().await.unwrap(), vec![7]);
        assert_eq!(storage.movie_file(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn favorite_toggle_parity() {
        let storage = test_store().await;
        storage.upsert_movie(1, "f").await.unwrap();

        assert!(storage.toggle_favorite(10, 1).await.unwrap());
        assert!(!storage.toggle_favorite(10, 1).await.unwrap());
        assert!(storage.favorites(10).await.unwrap().is_empty());

        assert!(storage.toggle_favorite(10, 1).await.unwrap());
        assert_eq!(storage.favorites(10).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn rating_upsert_and_cross_user_average() {
        let storage = test_store().await;
        storage.rate_movie(10, 7, 5).await.unwrap();
        storage.rate_movie(10, 7, 3).await.unwrap();
        storage.rate_movie(20, 7, 4).await.unwrap();

        // у каждого пользователя ровно одна строка, среднее по последним голосам
        assert_eq!(storage.average_rating(7).await.unwrap(), Some(3.5));
        assert_eq!(storage.average_rating(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reviews_append_and_list_recent_first() {
        let storage = test_store().await;
        storage.add_review(10, 7, "birinchi").await.unwrap();
        storage.add_review(10, 7, "ikkinchi").await.unwrap();

        let reviews = storage.recent_reviews(20).await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].text, "ikkinchi");
        assert_eq!(reviews[1].text, "birinchi");

        assert_eq!(storage.recent_reviews(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_reminders_future_only() {
        let storage = test_store().await;
        let now = Local::now().naive_local();
        storage
            .add_reminder(10, 7, now - Duration::hours(1))
            .await
            .unwrap();
        storage
            .add_reminder(10, 8, now + Duration::hours(1))
            .await
            .unwrap();

        let pending = storage.pending_reminders(now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].movie_id, 8);
        assert!(pending[0].remind_time > now);
    }

    #[tokio::test]
    async fn stats_count_per_user() {
        let storage = test_store().await;
        storage.upsert_movie(1, "f").await.unwrap();
        storage.toggle_favorite(10, 1).await.unwrap();
        storage.add_review(10, 1, "zo'r").await.unwrap();
        storage.add_review(10, 1, "yana").await.unwrap();
        storage.rate_movie(10, 1, 5).await.unwrap();
        storage
            .add_reminder(10, 1, Local::now().naive_local() + Duration::hours(1))
            .await
            .unwrap();

        let stats = storage.user_stats(10).await.unwrap();
        assert_eq!(
            stats,
            UserStats { favorites: 1, reviews: 2, ratings: 1, reminders: 1 }
        );

        let empty = storage.user_stats(20).await.unwrap();
        assert_eq!(
            empty,
            UserStats { favorites: 0, reviews: 0, ratings: 0, reminders: 0 }
        );
    }
}
