use std::{collections::HashMap, sync::Arc};

use teloxide::types::UserId;
use tokio::sync::RwLock;

/// Шаг диалога с промежуточными данными. У пользователя не больше одного
/// активного шага; новый затирает предыдущий вместе с данными.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Ждём видеофайл от админа.
    AwaitingVideo,
    /// Видео получено, ждём номер вида +N.
    AwaitingNumber { file_id: String },
    /// Ждём текст отзыва о кино.
    AwaitingReview { movie_id: i64 },
    /// Ждём дату и время напоминания.
    AwaitingReminder { movie_id: i64 },
}

/* ====== Трекер диалогов ======
   Состояние живёт только в памяти процесса: рестарт молча обрывает
   незавершённые диалоги. Передаётся хендлерам как зависимость. */
#[derive(Clone, Default)]
pub struct Tracker {
    inner: Arc<RwLock<HashMap<UserId, Flow>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user: UserId) -> Option<Flow> {
        self.inner.read().await.get(&user).cloned()
    }

    pub async fn set(&self, user: UserId, flow: Flow) {
        self.inner.write().await.insert(user, flow);
    }

    /// Атомарно забирает шаг: обработать его сможет ровно один хендлер.
    /// При ошибке ввода хендлер кладёт шаг обратно через set.
    pub async fn take(&self, user: UserId) -> Option<Flow> {
        self.inner.write().await.remove(&user)
    }

    pub async fn clear(&self, user: UserId) {
        self.inner.write().await.remove(&user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    #[tokio::test]
    async fn last_write_wins() {
        let tracker = Tracker::new();
        tracker.set(ALICE, Flow::AwaitingVideo).await;
        tracker.set(ALICE, Flow::AwaitingReview { movie_id: 7 }).await;

        assert_eq!(
            tracker.get(ALICE).await,
            Some(Flow::AwaitingReview { movie_id: 7 })
        );
    }

    #[tokio::test]
    async fn take_removes_the_flow() {
        let tracker = Tracker::new();
        tracker
            .set(ALICE, Flow::AwaitingNumber { file_id: "f".into() })
            .await;

        assert_eq!(
            tracker.take(ALICE).await,
            Some(Flow::AwaitingNumber { file_id: "f".into() })
        );
        assert_eq!(tracker.take(ALICE).await, None);
        assert_eq!(tracker.get(ALICE).await, None);
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let tracker = Tracker::new();
        tracker.clear(ALICE).await;
        tracker.set(ALICE, Flow::AwaitingVideo).await;
        tracker.clear(ALICE).await;
        tracker.clear(ALICE).await;

        assert_eq!(tracker.get(ALICE).await, None);
    }

    #[tokio::test]
    async fn users_are_independent() {
        let tracker = Tracker::new();
        tracker.set(ALICE, Flow::AwaitingVideo).await;
        tracker.set(BOB, Flow::AwaitingReminder { movie_id: 3 }).await;
        tracker.clear(ALICE).await;

        assert_eq!(tracker.get(ALICE).await, None);
        assert_eq!(
            tracker.get(BOB).await,
            Some(Flow::AwaitingReminder { movie_id: 3 })
        );
    }
}
