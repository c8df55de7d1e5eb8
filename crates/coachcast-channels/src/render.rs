//! Turn daily content into a channel-neutral notification, and format it per channel.

use coachcast_core::config::AppConfig;
use coachcast_core::types::{DailyContent, Notification, Subscriber};

const EXCERPT_CHARS: usize = 280;

pub fn library_link(base_url: &str, date: chrono::NaiveDate) -> String {
    format!("{}/library/{}", base_url.trim_end_matches('/'), date.format("%Y-%m-%d"))
}

pub fn render_notification(app: &AppConfig, subscriber: &Subscriber, content: &DailyContent) -> Notification {
    let first_paragraph = content
        .script
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("");
    let excerpt = truncate_chars(first_paragraph, EXCERPT_CHARS);

    let mut body = format!(
        "Hi {}, your coaching for {} is ready: \"{}\".",
        subscriber.first_name(),
        content.date.format("%A, %B %-d"),
        content.title
    );
    if !excerpt.is_empty() {
        body.push_str("\n\n");
        body.push_str(&excerpt);
    }

    Notification {
        subscriber_id: subscriber.id.clone(),
        title: format!("{}: {}", app.name, content.title),
        body,
        audio_url: content.audio_url.clone(),
        link: Some(library_link(&app.base_url, content.date)),
    }
}

/// Cut to at most `max` characters, ending with an ellipsis when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(max - 1).collect();
    out.push('…');
    out
}

/// Plain-text rendering for SMS, WhatsApp and email text parts.
pub fn plain_text(n: &Notification) -> String {
    let mut text = n.body.clone();
    if let Some(audio) = &n.audio_url {
        text.push_str(&format!("\n\nListen: {audio}"));
    }
    if let Some(link) = &n.link {
        text.push_str(&format!("\nLibrary: {link}"));
    }
    text
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

const TELEGRAM_LINK_LABEL: &str = "Open in your library";
const TELEGRAM_TITLE_CHARS: usize = 256;

/// Telegram's HTML subset: `<b>` and `<a>` only.
///
/// `max_chars` bounds the visible text (Telegram counts characters after entity
/// parsing), so title and body are cut before escaping and the markup stays intact.
pub fn telegram_html(n: &Notification, max_chars: usize) -> String {
    let link_chars = if n.link.is_some() { TELEGRAM_LINK_LABEL.chars().count() + 2 } else { 0 };
    let budget = max_chars.saturating_sub(link_chars + 2);
    let title = truncate_chars(&n.title, budget.min(TELEGRAM_TITLE_CHARS));
    let body = truncate_chars(&n.body, budget - title.chars().count());

    let mut text = format!("<b>{}</b>\n\n{}", escape_html(&title), escape_html(&body));
    if let Some(link) = &n.link {
        text.push_str(&format!("\n\n<a href=\"{}\">{TELEGRAM_LINK_LABEL}</a>", escape_html(link)));
    }
    text
}

pub fn email_html(n: &Notification) -> String {
    let paragraphs: String = n
        .body
        .split("\n\n")
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>")))
        .collect();
    let mut html = format!("<h2>{}</h2>{}", escape_html(&n.title), paragraphs);
    if let Some(audio) = &n.audio_url {
        html.push_str(&format!("<p><a href=\"{}\">▶ Listen to today's session</a></p>", escape_html(audio)));
    }
    if let Some(link) = &n.link {
        html.push_str(&format!("<p><a href=\"{}\">Open your library</a></p>", escape_html(link)));
    }
    html
}
