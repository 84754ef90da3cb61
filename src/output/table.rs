use chrono::{DateTime, Utc};

use crate::output::{EventLine, TokenStatus};

pub fn format_status(status: &TokenStatus) -> String {
    let mut out = String::new();
    out.push_str("Token Cache\n");
    out.push_str("===========\n");
    out.push_str(&format!("Path:      {}\n", status.cache_path));
    out.push_str(&format!(
        "Encrypted: {}\n",
        if status.encrypted { "yes" } else { "no" }
    ));

    if !status.cached {
        out.push_str("Cached:    none (next start signs in with a device code)\n");
        return out;
    }

    out.push_str(&format!(
        "Account:   {}\n",
        status.email.as_deref().unwrap_or("(unknown)")
    ));
    if let Some(expires_at) = status.expires_at {
        out.push_str(&format!(
            "Expires:   {} ({})\n",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            relative_expiry(expires_at, Utc::now())
        ));
    }
    out.push_str(&format!(
        "Usable:    {}\n",
        match (status.fresh, status.has_refresh_token) {
            (true, _) => "yes",
            (false, true) => "refresh on next start",
            (false, false) => "no (device code sign in required)",
        }
    ));
    out
}

pub fn format_event(line: &EventLine) -> String {
    let stamp = Utc::now().format("%H:%M:%S");
    match line {
        EventLine::Log { message } => format!("[{stamp}] {message}"),
        EventLine::AuthRequired {
            verification_url,
            user_code,
        } => format!(
            "[{stamp}] Sign in required\n  1. Open {verification_url}\n  2. Enter code: {user_code}"
        ),
        EventLine::NewMail { sender, subject } => {
            highlight(&format!("[{stamp}] New email\n  From: {sender}\n  Sub: {subject}"), 32)
        }
        EventLine::Error { message } => highlight(&format!("[{stamp}] Error: {message}"), 31),
    }
}

fn highlight(raw: &str, color: u8) -> String {
    format!("\u{1b}[{color}m{raw}\u{1b}[0m")
}

fn relative_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = expires_at.signed_duration_since(now);
    let minutes = delta.num_minutes();
    if minutes < 0 {
        let ago = -minutes;
        if ago < 60 {
            return format!("expired {ago}m ago");
        }
        return format!("expired {}h ago", ago / 60);
    }
    if minutes < 1 {
        return "expires now".to_string();
    }
    if minutes < 60 {
        return format!("in {minutes}m");
    }
    if delta.num_hours() < 24 {
        return format!("in {}h", delta.num_hours());
    }
    format!("in {}d", delta.num_days())
}
