//! Outcome classification, explicit per channel kind.

use crate::notification::ChannelKind;

use super::SendOutcome;

/// Classify an HTTP relay response status for `kind`.
pub fn classify_http_status(kind: ChannelKind, status: u16, detail: &str) -> SendOutcome {
    let reason = || {
        if detail.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, detail)
        }
    };

    match kind {
        ChannelKind::Email => match status {
            200..=299 => SendOutcome::Succeeded,
            408 | 429 => SendOutcome::TransientFailed(reason()),
            // 413: message too large for the relay, 422: rejected address
            400..=499 => SendOutcome::PermanentFailed(reason()),
            500..=599 => SendOutcome::TransientFailed(reason()),
            _ => SendOutcome::PermanentFailed(reason()),
        },
        ChannelKind::Sms => match status {
            200..=299 => SendOutcome::Succeeded,
            408 | 425 | 429 => SendOutcome::TransientFailed(reason()),
            400..=499 => SendOutcome::PermanentFailed(reason()),
            500..=599 => SendOutcome::TransientFailed(reason()),
            _ => SendOutcome::PermanentFailed(reason()),
        },
        ChannelKind::Push => match status {
            200..=299 => SendOutcome::Succeeded,
            408 | 429 => SendOutcome::TransientFailed(reason()),
            // Unregistered or expired device token
            404 | 410 => SendOutcome::PermanentFailed(reason()),
            400..=499 => SendOutcome::PermanentFailed(reason()),
            500..=599 => SendOutcome::TransientFailed(reason()),
            _ => SendOutcome::PermanentFailed(reason()),
        },
        ChannelKind::Webhook => match status {
            200..=299 => SendOutcome::Succeeded,
            408 | 409 | 425 | 429 => SendOutcome::TransientFailed(reason()),
            400..=499 => SendOutcome::PermanentFailed(reason()),
            501 | 505 => SendOutcome::PermanentFailed(reason()),
            500..=599 => SendOutcome::TransientFailed(reason()),
            // Redirects are followed by the client; anything left is unusable
            _ => SendOutcome::PermanentFailed(reason()),
        },
    }
}

/// Classify an SMTP reply code reported by an email relay.
///
/// 2xx accepted, 4xx transient (greylisting, mailbox busy), 5xx permanent.
pub fn classify_smtp_reply(code: u16, detail: &str) -> SendOutcome {
    let reason = || format!("SMTP {} {}", code, detail).trim_end().to_string();
    match code {
        200..=299 => SendOutcome::Succeeded,
        400..=499 => SendOutcome::TransientFailed(reason()),
        500..=599 => SendOutcome::PermanentFailed(reason()),
        _ => SendOutcome::PermanentFailed(reason()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_codes() {
        assert_eq!(classify_smtp_reply(250, "OK"), SendOutcome::Succeeded);
        assert_eq!(
            classify_smtp_reply(451, "try again later"),
            SendOutcome::TransientFailed("SMTP 451 try again later".into())
        );
        assert_eq!(
            classify_smtp_reply(550, ""),
            SendOutcome::PermanentFailed("SMTP 550".into())
        );
    }

    #[test]
    fn test_rate_limits_are_transient_everywhere() {
        for kind in ChannelKind::ALL {
            assert!(matches!(
                classify_http_status(kind, 429, ""),
                SendOutcome::TransientFailed(_)
            ));
            assert!(matches!(
                classify_http_status(kind, 503, "down"),
                SendOutcome::TransientFailed(_)
            ));
            assert_eq!(classify_http_status(kind, 202, ""), SendOutcome::Succeeded);
        }
    }

    #[test]
    fn test_channel_specific_statuses() {
        assert!(matches!(
            classify_http_status(ChannelKind::Push, 410, "unregistered"),
            SendOutcome::PermanentFailed(_)
        ));
        assert!(matches!(
            classify_http_status(ChannelKind::Webhook, 409, ""),
            SendOutcome::TransientFailed(_)
        ));
        assert!(matches!(
            classify_http_status(ChannelKind::Email, 409, ""),
            SendOutcome::PermanentFailed(_)
        ));
        assert!(matches!(
            classify_http_status(ChannelKind::Webhook, 501, ""),
            SendOutcome::PermanentFailed(_)
        ));
        assert_eq!(
            classify_http_status(ChannelKind::Sms, 400, "bad number"),
            SendOutcome::PermanentFailed("HTTP 400: bad number".into())
        );
    }
}
