use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::storage::Reminder;

/// Сработавший таймер. Доставкой занимается отдельный цикл,
/// планировщик наружу никуда не ходит.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub user_id: i64,
    pub movie_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobId(pub u64);

/* ====== Планировщик напоминаний ======
   Одноразовые таймеры в памяти. Срабатывание ровно одно на задачу,
   порядок между одинаковыми моментами не гарантируется. Отмена
   пользователю не доступна. Надёжная копия — строки в хранилище:
   на старте процесс заново взводит будущие (rearm). */
#[derive(Clone)]
pub struct Scheduler {
    tx: UnboundedSender<Fired>,
    next_id: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> (Self, UnboundedReceiver<Fired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        (scheduler, rx)
    }

    /// Взводит таймер; раньше fire_at событие не уйдёт.
    pub fn schedule(&self, fire_at: NaiveDateTime, user_id: i64, movie_id: i64) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let delay = (fire_at - Local::now().naive_local())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let tx = self.tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // получатель мог уже завершиться при остановке процесса
            let _ = tx.send(Fired { user_id, movie_id });
        });

        debug!("job {id:?}: user {user_id}, movie {movie_id}, fire at {fire_at}");
        id
    }

    /// Заново взводит таймеры по будущим строкам хранилища.
    pub fn rearm(&self, reminders: &[Reminder]) -> usize {
        for r in reminders {
            self.schedule(r.remind_time, r.user_id, r.movie_id);
        }
        reminders.len()
    }
}
