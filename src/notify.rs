use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    pub title: String,
    pub body: String,
}

/// Best-effort push dispatcher. Delivery is never awaited by the caller and
/// failures only reach the logs.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl Notifier {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn group_topic(group_id: &str) -> String {
        format!("group_{}", group_id)
    }

    pub fn dispatch(&self, notification: Notification) {
        let Some(endpoint) = self.endpoint.clone() else {
            tracing::debug!(
                "No notification endpoint configured, dropping {}",
                notification.topic
            );
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client
                .post(&endpoint)
                .json(&notification)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match result {
                Ok(_) => tracing::debug!("Notification sent to topic {}", notification.topic),
                Err(e) => tracing::warn!(
                    "Failed to send notification to topic {}: {}",
                    notification.topic,
                    e
                ),
            }
        });
    }
}

/// Shortens post text for a push body without splitting a character.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_short_text_and_cuts_long_text() {
        assert_eq!(preview("salut", 10), "salut");
        assert_eq!(preview("éééééé", 3), "ééé…");
    }

    #[tokio::test]
    async fn dispatch_to_unreachable_endpoint_does_not_panic() {
        let notifier = Notifier::new(Some("http://127.0.0.1:9/push".into()));
        notifier.dispatch(Notification {
            topic: Notifier::group_topic("g1"),
            title: "t".into(),
            body: "b".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
