use chrono::{Local, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{
        CallbackQuery, ChatId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile,
    },
    utils::command::BotCommands,
};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::config::Admins;
use crate::scheduler::{Fired, Scheduler};
use crate::state::{Flow, Tracker};
use crate::storage::Storage;

/* ====== Тексты ====== */

const TEXT_FAIL: &str = "❌ Xatolik yuz berdi. Iltimos, keyinroq urunib ko'ring.";
const TEXT_ADMIN_ONLY: &str = "❌ Bu buyruq faqat adminlar uchun.";
const TEXT_UNKNOWN: &str = "🤖 Noma'lum buyruq.\n/start ni bosing yoki kinoning raqamini yozing.";
const TEXT_NOT_FOUND: &str = "❌ Bunday kino topilmadi. /start ni bosing va ro‘yxatdan tanlang.";

const REMIND_FORMAT: &str = "%Y-%m-%d %H:%M";

static MOVIE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

/* ====== Команды ====== */

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Admin,
    Reviews,
    Myfavorites,
    Mystats,
}

pub async fn run(
    bot: Bot,
    storage: Storage,
    tracker: Tracker,
    scheduler: Scheduler,
    admins: Admins,
) {
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                // активный диалог перехватывает сообщение раньше команд;
                // шаг забирается атомарно, второй хендлер его не увидит
                .branch(
                    dptree::filter_map_async(|msg: Message, tracker: Tracker| async move {
                        let user = msg.from.as_ref()?.id;
                        tracker.take(user).await
                    })
                    .endpoint(on_flow_message),
                )
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(on_command),
                )
                .branch(dptree::endpoint(on_text)),
        )
        .branch(Update::filter_callback_query().endpoint(on_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![storage, tracker, scheduler, admins])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/* ====== Шаги диалога ====== */

async fn on_flow_message(
    bot: Bot,
    msg: Message,
    flow: Flow,
    tracker: Tracker,
    storage: Storage,
    scheduler: Scheduler,
) -> ResponseResult<()> {
    if let Err(err) = try_flow_message(&bot, &msg, flow, &tracker, &storage, &scheduler).await {
        report_failure(&bot, msg.chat.id, "flow", err).await;
    }
    Ok(())
}

async fn try_flow_message(
    bot: &Bot,
    msg: &Message,
    flow: Flow,
    tracker: &Tracker,
    storage: &Storage,
    scheduler: &Scheduler,
) -> anyhow::Result<()> {
    let Some(user) = msg.from.as_ref().map(|u| u.id) else {
        return Ok(());
    };

    match flow {
        Flow::AwaitingVideo => match msg.video() {
            Some(video) => {
                tracker
                    .set(user, Flow::AwaitingNumber { file_id: video.file.id.0.clone() })
                    .await;
                bot.send_message(
                    msg.chat.id,
                    "✅ Video qabul qilindi.\nEndi unga raqam belgilang (masalan: +1, +2, +3):",
                )
                .await?;
            }
            None => {
                tracker.set(user, Flow::AwaitingVideo).await;
                bot.send_message(msg.chat.id, "❌ Iltimos, faqat video yuboring!")
                    .await?;
            }
        },

        Flow::AwaitingNumber { file_id } => {
            match msg.text().and_then(parse_movie_label) {
                Some(number) => {
                    storage.upsert_movie(number, &file_id).await?;
                    info!("movie #{number} saved by admin {user}");
                    bot.send_message(
                        msg.chat.id,
                        format!("✅ Kino muvaffaqiyatli saqlandi!\n➡️ Raqami: {number}"),
                    )
                    .await?;
                }
                None => {
                    tracker.set(user, Flow::AwaitingNumber { file_id }).await;
                    bot.send_message(
                        msg.chat.id,
                        "❌ Iltimos, + bilan boshlanuvchi son yuboring. Masalan: +2",
                    )
                    .await?;
                }
            }
        }

        Flow::AwaitingReview { movie_id } => match message_text_any(msg) {
            Some(text) => {
                storage.add_review(user.0 as i64, movie_id, &text).await?;
                bot.send_message(msg.chat.id, "✅ Fikringiz saqlandi va adminga yuborildi.")
                    .await?;
            }
            None => {
                tracker.set(user, Flow::AwaitingReview { movie_id }).await;
                bot.send_message(msg.chat.id, "❌ Iltimos, sharhni matn ko'rinishida yuboring.")
                    .await?;
            }
        },

        Flow::AwaitingReminder { movie_id } => {
            let text = message_text_any(msg).unwrap_or_default();
            match parse_remind_at(text.trim(), Local::now().naive_local()) {
                Ok(remind_at) => {
                    storage
                        .add_reminder(user.0 as i64, movie_id, remind_at)
                        .await?;
                    scheduler.schedule(remind_at, user.0 as i64, movie_id);
                    bot.send_message(
                        msg.chat.id,
                        format!(
                            "✅ Eslatma o'rnatildi! {} da eslatib beraman.",
                            remind_at.format(REMIND_FORMAT)
                        ),
                    )
                    .await?;
                }
                Err(err) => {
                    tracker.set(user, Flow::AwaitingReminder { movie_id }).await;
                    let reply = match err {
                        RemindTimeError::Format => {
                            "❌ Noto'g'ri format. Iltimos YYYY-MM-DD HH:MM formatda yuboring."
                        }
                        RemindTimeError::Past => {
                            "❌ Kechikkan vaqt! Iltimos, kelajakdagi vaqtni kiriting."
                        }
                    };
                    bot.send_message(msg.chat.id, reply).await?;
                }
            }
        }
    }

    Ok(())
}

/* ====== Команды ====== */

async fn on_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    storage: Storage,
    tracker: Tracker,
    admins: Admins,
) -> ResponseResult<()> {
    if let Err(err) = try_command(&bot, &msg, cmd, &storage, &tracker, &admins).await {
        report_failure(&bot, msg.chat.id, "command", err).await;
    }
    Ok(())
}

async fn try_command(
    bot: &Bot,
    msg: &Message,
    cmd: Command,
    storage: &Storage,
    tracker: &Tracker,
    admins: &Admins,
) -> anyhow::Result<()> {
    let Some(user) = msg.from.as_ref().map(|u| u.id) else {
        return Ok(());
    };
    let chat = msg.chat.id;

    match cmd {
        Command::Start => {
            let favs = storage.favorites(user.0 as i64).await?;
            if !favs.is_empty() {
                let list = favs
                    .iter()
                    .map(|n| format!("Kino #{n}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                bot.send_message(chat, format!("💖 Sizning sevimlilaringiz:\n{list}"))
                    .await?;
            }

            let numbers = storage.movie_numbers().await?;
            if numbers.is_empty() {
                bot.send_message(chat, "📭 Hozircha kinolar mavjud emas.").await?;
            } else {
                let list = numbers
                    .iter()
                    .map(|n| format!("{n}: Kino #{n}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                bot.send_message(chat, format!("🎬 Kino tanlash uchun raqamini yozing:\n\n{list}"))
                    .await?;
            }
        }

        Command::Admin => {
            if !admins.contains(user) {
                bot.send_message(chat, TEXT_ADMIN_ONLY).await?;
                return Ok(());
            }
            tracker.set(user, Flow::AwaitingVideo).await;
            bot.send_message(
                chat,
                "👮 Admin panelga xush kelibsiz.\n\n🎬 Iltimos, kino video faylini yuboring.",
            )
            .await?;
        }

        Command::Reviews => {
            if !admins.contains(user) {
                bot.send_message(chat, TEXT_ADMIN_ONLY).await?;
                return Ok(());
            }
            let reviews = storage.recent_reviews(20).await?;
            if reviews.is_empty() {
                bot.send_message(chat, "📝 Hozircha sharhlar mavjud emas.").await?;
                return Ok(());
            }
            let mut out = String::from("📝 So'nggi 20 ta sharh:\n\n");
            for r in &reviews {
                out.push_str(&format!(
                    "👤 Foydalanuvchi {}\n🎬 Kino #{}\n💬 {}\n⏰ {}\n\n",
                    r.user_id,
                    r.movie_id,
                    r.text,
                    r.created_at.format(REMIND_FORMAT)
                ));
            }
            bot.send_message(chat, out).await?;
        }

        Command::Myfavorites => {
            let favs = storage.favorites(user.0 as i64).await?;
            if favs.is_empty() {
                bot.send_message(chat, "💔 Sizda hali sevimli kinolar yo'q.").await?;
                return Ok(());
            }
            let list = favs
                .iter()
                .enumerate()
                .map(|(i, n)| format!("{}. Kino #{n}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            bot.send_message(
                chat,
                format!(
                    "💖 Sizning sevimli kinolaringiz:\n\n{list}\n\nKo'rish uchun kino raqamini yozing."
                ),
            )
            .await?;
        }

        Command::Mystats => {
            let stats = storage.user_stats(user.0 as i64).await?;
            bot.send_message(
                chat,
                format!(
                    "📊 Sizning statistikangiz:\n\n\
                     💖 Sevimlilar: {}\n\
                     ✍️ Sharhlar: {}\n\
                     ⭐ Reytinglar: {}\n\
                     ⏰ Eslatmalar: {}",
                    stats.favorites, stats.reviews, stats.ratings, stats.reminders
                ),
            )
            .await?;
        }
    }

    Ok(())
}

/* ====== Свободный текст: выбор кино по номеру ====== */

async fn on_text(bot: Bot, msg: Message, storage: Storage) -> ResponseResult<()> {
    if let Err(err) = try_text(&bot, &msg, &storage).await {
        report_failure(&bot, msg.chat.id, "text", err).await;
    }
    Ok(())
}

async fn try_text(bot: &Bot, msg: &Message, storage: &Storage) -> anyhow::Result<()> {
    let number = msg
        .text()
        .map(str::trim)
        .filter(|t| MOVIE_NUMBER.is_match(t))
        .and_then(|t| t.parse::<i64>().ok());

    let Some(number) = number else {
        bot.send_message(msg.chat.id, TEXT_UNKNOWN).await?;
        return Ok(());
    };

    match storage.movie_file(number).await? {
        Some(file_id) => {
            let avg = storage.average_rating(number).await?;
            bot.send_video(msg.chat.id, InputFile::file_id(FileId(file_id)))
                .caption(movie_caption(number, avg))
                .reply_markup(movie_buttons(number))
                .await?;
        }
        None => {
            bot.send_message(msg.chat.id, TEXT_NOT_FOUND).await?;
        }
    }

    Ok(())
}

/* ====== Callback-кнопки ====== */

async fn on_callback(
    bot: Bot,
    q: CallbackQuery,
    storage: Storage,
    tracker: Tracker,
) -> ResponseResult<()> {
    if let Err(err) = try_callback(&bot, &q, &storage, &tracker).await {
        error!("callback handler failed: {err:#}");
        let _ = bot
            .answer_callback_query(q.id.clone())
            .text(TEXT_FAIL)
            .show_alert(false)
            .await;
    }
    Ok(())
}

async fn try_callback(
    bot: &Bot,
    q: &CallbackQuery,
    storage: &Storage,
    tracker: &Tracker,
) -> anyhow::Result<()> {
    let Some(data) = q.data.as_deref() else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    let action = match parse_action(data) {
        Ok(action) => action,
        Err(err) => {
            // кнопки собираем мы сами, сюда попадать не должно
            warn!("{err}");
            bot.answer_callback_query(q.id.clone()).await?;
            return Ok(());
        }
    };

    let user = q.from.id;

    match action {
        Action::Fav(movie_id) => {
            if storage.movie_file(movie_id).await?.is_none() {
                answer_cb(bot, q, "❌ Bu kino mavjud emas!").await?;
                return Ok(());
            }
            let added = storage.toggle_favorite(user.0 as i64, movie_id).await?;
            let reply = if added {
                "💖 Kino sevimlilarga qo'shildi!"
            } else {
                "❌ Kino sevimlilardan olib tashlandi!"
            };
            answer_cb(bot, q, reply).await?;
        }

        Action::Review(movie_id) => {
            tracker.set(user, Flow::AwaitingReview { movie_id }).await;
            if let Some(m) = q.message.as_ref() {
                bot.send_message(m.chat().id, "✍️ Fikringizni yozing:").await?;
            }
            bot.answer_callback_query(q.id.clone()).await?;
        }

        Action::Remind(movie_id) => {
            tracker.set(user, Flow::AwaitingReminder { movie_id }).await;
            if let Some(m) = q.message.as_ref() {
                bot.send_message(
                    m.chat().id,
                    "⏰ Kino ko'rish vaqti va sanasini yozing (YYYY-MM-DD HH:MM):",
                )
                .await?;
            }
            bot.answer_callback_query(q.id.clone()).await?;
        }

        Action::Rate { movie_id, stars } => {
            storage.rate_movie(user.0 as i64, movie_id, stars).await?;
            let avg = storage
                .average_rating(movie_id)
                .await?
                .unwrap_or(stars as f64);

            // правка подписи под видео — best effort, сообщение могло устареть
            if let Some(m) = q.message.as_ref() {
                let _ = bot
                    .edit_message_caption(m.chat().id, m.id())
                    .caption(movie_caption(movie_id, Some(avg)))
                    .reply_markup(movie_buttons(movie_id))
                    .await;
            }

            answer_cb(
                bot,
                q,
                &format!("⭐ Siz {stars} baho berdingiz! O'rtacha: {avg:.1}"),
            )
            .await?;
        }
    }

    Ok(())
}

/* ====== Полезная нагрузка кнопок ======
   fav_<id> | review_<id> | remind_<id> | rate_<id>_<stars> */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Fav(i64),
    Review(i64),
    Remind(i64),
    Rate { movie_id: i64, stars: u8 },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed callback payload: {0:?}")]
struct BadPayload(String);

fn parse_action(data: &str) -> Result<Action, BadPayload> {
    let (prefix, rest) = data
        .split_once('_')
        .ok_or_else(|| BadPayload(data.to_string()))?;

    match prefix {
        "fav" => Ok(Action::Fav(parse_id(data, rest)?)),
        "review" => Ok(Action::Review(parse_id(data, rest)?)),
        "remind" => Ok(Action::Remind(parse_id(data, rest)?)),
        "rate" => {
            let (id, stars) = rest
                .split_once('_')
                .ok_or_else(|| BadPayload(data.to_string()))?;
            let movie_id = parse_id(data, id)?;
            let stars: u8 = stars.parse().map_err(|_| BadPayload(data.to_string()))?;
            if !(1..=5).contains(&stars) {
                return Err(BadPayload(data.to_string()));
            }
            Ok(Action::Rate { movie_id, stars })
        }
        _ => Err(BadPayload(data.to_string())),
    }
}

fn parse_id(payload: &str, raw: &str) -> Result<i64, BadPayload> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BadPayload(payload.to_string()));
    }
    raw.parse().map_err(|_| BadPayload(payload.to_string()))
}

/* ====== Представление кино ====== */

/// Подпись к видео: номер и средний рейтинг, если уже есть оценки.
fn movie_caption(number: i64, avg: Option<f64>) -> String {
    match avg {
        Some(avg) => format!("Kino #{number}\n⭐ O'rtacha reyting: {avg:.1}"),
        None => format!("Kino #{number}"),
    }
}

fn movie_buttons(movie_id: i64) -> InlineKeyboardMarkup {
    let mut rows = vec![
        vec![
            InlineKeyboardButton::callback("💖 Sevimlilarga qo'shish", format!("fav_{movie_id}")),
            InlineKeyboardButton::callback("✍️ Sharh yozish", format!("review_{movie_id}")),
        ],
        vec![
            InlineKeyboardButton::callback("⏰ Eslatma o'rnatish", format!("remind_{movie_id}")),
            InlineKeyboardButton::switch_inline_query(
                "📤 Do'stlarga ulashish",
                format!("Kino #{movie_id}"),
            ),
        ],
    ];

    rows.push(
        (1..=5)
            .map(|s| InlineKeyboardButton::callback(format!("{s}⭐"), format!("rate_{movie_id}_{s}")))
            .collect(),
    );

    InlineKeyboardMarkup::new(rows)
}

/* ====== Доставка напоминаний ====== */

/// Цикл доставки: читает сработавшие таймеры и шлёт напоминание с видео.
/// Сбои доставки не ретраятся.
pub async fn deliver_reminders(bot: Bot, storage: Storage, mut fired: UnboundedReceiver<Fired>) {
    while let Some(event) = fired.recv().await {
        if let Err(err) = send_reminder(&bot, &storage, event).await {
            warn!("reminder delivery failed for user {}: {err:#}", event.user_id);
        }
    }
}

async fn send_reminder(bot: &Bot, storage: &Storage, event: Fired) -> anyhow::Result<()> {
    // единственное обращение к хранилищу при срабатывании: достать file_id
    let Some(file_id) = storage.movie_file(event.movie_id).await? else {
        return Ok(());
    };
    let chat = ChatId(event.user_id);

    bot.send_message(chat, format!("⏰ Esingizda! Kino #{} vaqti keldi!", event.movie_id))
        .await?;
    bot.send_video(chat, InputFile::file_id(FileId(file_id)))
        .caption(movie_caption(event.movie_id, None))
        .await?;

    Ok(())
}

/* ====== Вспомогательные ====== */

#[derive(Debug, PartialEq, Eq)]
enum RemindTimeError {
    Format,
    Past,
}

/// Дата напоминания: строго будущее время в формате YYYY-MM-DD HH:MM.
fn parse_remind_at(text: &str, now: NaiveDateTime) -> Result<NaiveDateTime, RemindTimeError> {
    let parsed =
        NaiveDateTime::parse_from_str(text, REMIND_FORMAT).map_err(|_| RemindTimeError::Format)?;
    if parsed <= now {
        return Err(RemindTimeError::Past);
    }
    Ok(parsed)
}

/// Метка админа при загрузке: +N.
fn parse_movie_label(text: &str) -> Option<i64> {
    let rest = text.trim().strip_prefix('+')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

fn message_text_any(msg: &Message) -> Option<String> {
    if let Some(t) = msg.text() {
        return Some(t.to_string());
    }
    if let Some(c) = msg.caption() {
        return Some(c.to_string());
    }
    None
}

async fn answer_cb(bot: &Bot, q: &CallbackQuery, text: &str) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone())
        .text(text)
        .show_alert(false)
        .await?;
    Ok(())
}

async fn report_failure(bot: &Bot, chat: ChatId, what: &str, err: anyhow::Error) {
    error!("{what} handler failed: {err:#}");
    let _ = bot.send_message(chat, TEXT_FAIL).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use teloxide::types::InlineKeyboardButtonKind;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, REMIND_FORMAT).unwrap()
    }

    #[test]
    fn caption_without_ratings() {
        assert_eq!(movie_caption(7, None), "Kino #7");
    }

    #[test]
    fn caption_with_average() {
        assert_eq!(movie_caption(7, Some(4.0)), "Kino #7\n⭐ O'rtacha reyting: 4.0");
        assert_eq!(movie_caption(3, Some(3.5)), "Kino #3\n⭐ O'rtacha reyting: 3.5");
    }

    #[test]
    fn buttons_layout() {
        let kb = movie_buttons(7);
        let rows = &kb.inline_keyboard;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[1].len(), 2);
        // ровно пять звёздных кнопок
        assert_eq!(rows[2].len(), 5);

        match &rows[0][0].kind {
            InlineKeyboardButtonKind::CallbackData(data) => assert_eq!(data, "fav_7"),
            other => panic!("unexpected kind: {other:?}"),
        }
        match &rows[1][1].kind {
            InlineKeyboardButtonKind::SwitchInlineQuery(query) => assert_eq!(query, "Kino #7"),
            other => panic!("unexpected kind: {other:?}"),
        }
        match &rows[2][4].kind {
            InlineKeyboardButtonKind::CallbackData(data) => assert_eq!(data, "rate_7_5"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn action_decoder_accepts_known_shapes() {
        assert_eq!(parse_action("fav_7"), Ok(Action::Fav(7)));
        assert_eq!(parse_action("review_12"), Ok(Action::Review(12)));
        assert_eq!(parse_action("remind_3"), Ok(Action::Remind(3)));
        assert_eq!(
            parse_action("rate_7_4"),
            Ok(Action::Rate { movie_id: 7, stars: 4 })
        );
    }

    #[test]
    fn action_decoder_rejects_malformed() {
        for payload in [
            "", "fav", "fav_", "fav_x", "fav_-1", "rate_7", "rate_7_", "rate_7_0", "rate_7_6",
            "rate_x_4", "drop_7", "fav_7_9",
        ] {
            assert!(parse_action(payload).is_err(), "accepted {payload:?}");
        }
    }

    #[test]
    fn decoder_rejects_overflowing_id() {
        let payload = format!("fav_{}0", i64::MAX);
        assert!(parse_action(&payload).is_err());
    }

    #[test]
    fn movie_label_requires_plus_and_digits() {
        assert_eq!(parse_movie_label("+7"), Some(7));
        assert_eq!(parse_movie_label("  +42  "), Some(42));
        assert_eq!(parse_movie_label("7"), None);
        assert_eq!(parse_movie_label("+"), None);
        assert_eq!(parse_movie_label("+7a"), None);
        assert_eq!(parse_movie_label("++7"), None);
        assert_eq!(parse_movie_label("+99999999999999999999999"), None);
    }

    #[test]
    fn remind_at_accepts_future_datetime() {
        let now = dt("2026-08-06 12:00");
        assert_eq!(parse_remind_at("2026-08-06 12:01", now), Ok(dt("2026-08-06 12:01")));
    }

    #[test]
    fn remind_at_rejects_past_and_present() {
        let now = dt("2026-08-06 12:00");
        assert_eq!(parse_remind_at("2025-01-01 00:00", now), Err(RemindTimeError::Past));
        assert_eq!(parse_remind_at("2026-08-06 12:00", now), Err(RemindTimeError::Past));
    }

    #[test]
    fn remind_at_rejects_bad_format() {
        let now = dt("2026-08-06 12:00");
        for text in ["", "ertaga", "2026-08-06", "06.08.2026 12:30", "2026-08-06T12:30"] {
            assert_eq!(parse_remind_at(text, now), Err(RemindTimeError::Format));
        }
    }

    #[test]
    fn remind_format_roundtrip() {
        let d = NaiveDate::from_ymd_opt(2026, 8, 6)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(d.format(REMIND_FORMAT).to_string(), "2026-08-06 12:30");
    }
}
