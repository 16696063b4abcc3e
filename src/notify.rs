// =============================================================================
// Notifications — pure template rendering + dispatch trait
// =============================================================================
//
// Rendering is a pure function from SignalData to a RenderedMessage with
// four projections (title, plain text, HTML, rich text). Only the sink
// performs side effects; channel-specific wrappers (Telegram, email,
// webhook) live outside the core behind `NotificationSink`.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::info;

use crate::config::NotifyConfig;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Everything a template may reference. Exit-side fields stay `None` for
/// entry/alert messages.
#[derive(Debug, Clone, Serialize)]
pub struct SignalData {
    pub symbol: String,
    pub current_price: f64,
    /// The 14:30 anchor.
    pub base_price: f64,
    /// Signed drop from the base price (-0.012 = down 1.2 %).
    pub drop_pct: f64,
    pub timestamp: NaiveDateTime,
    pub entry_price: Option<f64>,
    pub profit: Option<f64>,
    pub profit_pct: Option<f64>,
    pub monthly_pnl: Option<f64>,
    /// First-entry threshold, for alert context.
    pub buy_threshold: Option<f64>,
}

/// A rendered notification, ready for any channel.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedMessage {
    pub title: String,
    pub plain: String,
    pub html: String,
    pub rich_text: String,
}

/// Transport abstraction. Implementations route the rendered message to
/// whatever subset of `config.channels` they support.
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, config: &NotifyConfig, message: &RenderedMessage);
}

/// Default sink: structured log lines only. Useful headless and in tests.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn dispatch(&self, config: &NotifyConfig, message: &RenderedMessage) {
        info!(
            channels = ?config.channels,
            title = %message.title,
            "notification dispatched"
        );
    }
}

// ---------------------------------------------------------------------------
// Renderers
// ---------------------------------------------------------------------------

const TS_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// BUY entry signal (L1 or L2).
pub fn render_buy_signal(data: &SignalData) -> RenderedMessage {
    let drop_display = data.drop_pct.abs() * 100.0;
    let title = format!("[BUY] {} down {:.2}%", data.symbol, drop_display);

    let plain = format!(
        "Settlement arbitrage BUY signal\n\
         Contract:   {}\n\
         Price:      {:.2}\n\
         Base price: {:.2} (14:30 anchor)\n\
         Drop:       {:.2}%\n\
         Time:       {}",
        data.symbol,
        data.current_price,
        data.base_price,
        drop_display,
        data.timestamp.format(TS_FMT),
    );

    let rich_text = format!(
        "*BUY* `{}`\nprice {:.2} | base {:.2} | down {:.2}%\n{}",
        data.symbol,
        data.current_price,
        data.base_price,
        drop_display,
        data.timestamp.format(TS_FMT),
    );

    let html = build_email_html(
        &title,
        &[
            ("Contract", data.symbol.clone()),
            ("Price", format!("{:.2}", data.current_price)),
            ("Base price (14:30)", format!("{:.2}", data.base_price)),
            ("Drop", format!("{drop_display:.2}%")),
            ("Time", data.timestamp.format(TS_FMT).to_string()),
        ],
    );

    RenderedMessage {
        title,
        plain,
        html,
        rich_text,
    }
}

/// SELL close signal (day-open flatten).
pub fn render_sell_signal(data: &SignalData) -> RenderedMessage {
    let profit = data.profit.unwrap_or(0.0);
    let profit_pct = data.profit_pct.unwrap_or(0.0) * 100.0;
    let entry = data.entry_price.unwrap_or(0.0);
    let title = format!("[SELL] {} P&L {:+.2}", data.symbol, profit);

    let plain = format!(
        "Settlement arbitrage SELL signal\n\
         Contract:    {}\n\
         Exit price:  {:.2} (next-day open)\n\
         Entry price: {:.2} (avg)\n\
         P&L:         {:+.2} ({:+.2}%)\n\
         Time:        {}",
        data.symbol,
        data.current_price,
        entry,
        profit,
        profit_pct,
        data.timestamp.format(TS_FMT),
    );

    let rich_text = format!(
        "*SELL* `{}`\nexit {:.2} | entry {:.2} | pnl {:+.2} ({:+.2}%)\n{}",
        data.symbol,
        data.current_price,
        entry,
        profit,
        profit_pct,
        data.timestamp.format(TS_FMT),
    );

    let html = build_email_html(
        &title,
        &[
            ("Contract", data.symbol.clone()),
            ("Exit price", format!("{:.2}", data.current_price)),
            ("Entry price (avg)", format!("{entry:.2}")),
            ("P&L", format!("{profit:+.2} ({profit_pct:+.2}%)")),
            ("Time", data.timestamp.format(TS_FMT).to_string()),
        ],
    );

    RenderedMessage {
        title,
        plain,
        html,
        rich_text,
    }
}

/// Early-warning price alert.
pub fn render_price_alert(data: &SignalData) -> RenderedMessage {
    let drop_display = data.drop_pct.abs() * 100.0;
    let threshold_display = data.buy_threshold.unwrap_or(0.01) * 100.0;
    let title = format!("[ALERT] {} down {:.2}%", data.symbol, drop_display);

    let plain = format!(
        "Price approaching buy threshold\n\
         Contract:      {}\n\
         Price:         {:.2}\n\
         Base price:    {:.2}\n\
         Drop:          {:.2}%\n\
         Buy threshold: {:.2}%\n\
         Time:          {}",
        data.symbol,
        data.current_price,
        data.base_price,
        drop_display,
        threshold_display,
        data.timestamp.format(TS_FMT),
    );

    let rich_text = format!(
        "*ALERT* `{}`\ndown {:.2}% (buy at {:.2}%)\n{}",
        data.symbol,
        drop_display,
        threshold_display,
        data.timestamp.format(TS_FMT),
    );

    let html = build_email_html(
        &title,
        &[
            ("Contract", data.symbol.clone()),
            ("Price", format!("{:.2}", data.current_price)),
            ("Drop", format!("{drop_display:.2}%")),
            ("Buy threshold", format!("{threshold_display:.2}%")),
            ("Time", data.timestamp.format(TS_FMT).to_string()),
        ],
    );

    RenderedMessage {
        title,
        plain,
        html,
        rich_text,
    }
}

/// Per-trade P&L report.
pub fn render_pnl_report(data: &SignalData) -> RenderedMessage {
    let profit = data.profit.unwrap_or(0.0);
    let profit_pct = data.profit_pct.unwrap_or(0.0) * 100.0;
    let entry = data.entry_price.unwrap_or(0.0);
    let monthly = data.monthly_pnl.unwrap_or(0.0);
    let title = format!("[REPORT] {} trade P&L {:+.2}", data.symbol, profit);

    let plain = format!(
        "Settlement arbitrage trade report\n\
         Contract:    {}\n\
         Entry price: {:.2}\n\
         Exit price:  {:.2}\n\
         P&L:         {:+.2} ({:+.2}%)\n\
         Month P&L:   {:+.2}\n\
         Time:        {}",
        data.symbol,
        entry,
        data.current_price,
        profit,
        profit_pct,
        monthly,
        data.timestamp.format(TS_FMT),
    );

    let rich_text = format!(
        "*REPORT* `{}`\npnl {:+.2} ({:+.2}%) | month {:+.2}\n{}",
        data.symbol,
        profit,
        profit_pct,
        monthly,
        data.timestamp.format(TS_FMT),
    );

    let html = build_email_html(
        &title,
        &[
            ("Contract", data.symbol.clone()),
            ("Entry price", format!("{entry:.2}")),
            ("Exit price", format!("{:.2}", data.current_price)),
            ("P&L", format!("{profit:+.2} ({profit_pct:+.2}%)")),
            ("Month P&L", format!("{monthly:+.2}")),
            ("Time", data.timestamp.format(TS_FMT).to_string()),
        ],
    );

    RenderedMessage {
        title,
        plain,
        html,
        rich_text,
    }
}

// ---------------------------------------------------------------------------
// HTML helper
// ---------------------------------------------------------------------------

fn build_email_html(title: &str, rows: &[(&str, String)]) -> String {
    let mut body = String::new();
    for (label, value) in rows {
        body.push_str(&format!(
            "<tr><td style=\"padding:4px 12px 4px 0;color:#666;\">{}</td>\
             <td style=\"padding:4px 0;\">{}</td></tr>",
            esc(label),
            esc(value)
        ));
    }
    format!(
        "<div style=\"font-family:sans-serif;font-size:14px;\">\
         <div style=\"font-size:16px;font-weight:600;margin-bottom:8px;\">{}</div>\
         <table>{}</table></div>",
        esc(title),
        body
    )
}

fn esc(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> SignalData {
        SignalData {
            symbol: "IM0".into(),
            current_price: 5840.0,
            base_price: 5900.0,
            drop_pct: -0.010169,
            timestamp: NaiveDateTime::parse_from_str("2026-02-09 14:40:00", "%Y-%m-%d %H:%M:%S")
                .unwrap(),
            entry_price: None,
            profit: None,
            profit_pct: None,
            monthly_pnl: None,
            buy_threshold: None,
        }
    }

    #[test]
    fn buy_message_shows_drop_as_positive_percent() {
        let msg = render_buy_signal(&data());
        assert!(msg.title.contains("BUY"));
        assert!(msg.title.contains("1.02%"));
        assert!(msg.plain.contains("5840.00"));
        assert!(msg.plain.contains("5900.00"));
        assert!(msg.plain.contains("2026-02-09 14:40:00"));
        assert!(msg.html.contains("<table>"));
        assert!(msg.rich_text.contains("IM0"));
    }

    #[test]
    fn sell_message_carries_pnl_fields() {
        let mut d = data();
        d.current_price = 5880.0;
        d.entry_price = Some(5840.0);
        d.profit = Some(7946.09);
        d.profit_pct = Some(0.00685);
        let msg = render_sell_signal(&d);

        assert!(msg.title.contains("SELL"));
        assert!(msg.title.contains("+7946.09"));
        assert!(msg.plain.contains("5880.00"));
        assert!(msg.plain.contains("5840.00"));
        assert!(msg.plain.contains("+0.69%"));
    }

    #[test]
    fn alert_message_names_the_buy_threshold() {
        let mut d = data();
        d.drop_pct = -0.0081;
        d.buy_threshold = Some(0.01);
        let msg = render_price_alert(&d);

        assert!(msg.title.contains("ALERT"));
        assert!(msg.plain.contains("0.81%"));
        assert!(msg.plain.contains("1.00%"));
    }

    #[test]
    fn pnl_report_includes_monthly_total() {
        let mut d = data();
        d.entry_price = Some(5840.0);
        d.current_price = 5880.0;
        d.profit = Some(7946.09);
        d.profit_pct = Some(0.00685);
        d.monthly_pnl = Some(12_500.0);
        let msg = render_pnl_report(&d);

        assert!(msg.title.contains("REPORT"));
        assert!(msg.plain.contains("+12500.00"));
    }

    #[test]
    fn html_escapes_markup() {
        let mut d = data();
        d.symbol = "IM<0>".into();
        let msg = render_buy_signal(&d);
        assert!(msg.html.contains("IM&lt;0&gt;"));
        assert!(!msg.html.contains("IM<0>"));
    }
}
