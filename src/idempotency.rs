use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;
use uuid::Uuid;

/// Cache key for a submit retried with the same `Idempotency-Key`. Scoped to
/// the partner and session so keys never collide across either.
pub fn receipt_key(partner_id: &str, wizard_id: Uuid, key: &str) -> String {
    format!("idem:{partner_id}:{wizard_id}:{key}")
}

pub async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "onboarding.api", error = %err, "idempotency cache unavailable");
            return None;
        }
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set<T: Serialize>(client: &redis::Client, key: &str, value: &T, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_partner_and_session() {
        let id = Uuid::nil();
        assert_eq!(
            receipt_key("acme", id, "k-1"),
            "idem:acme:00000000-0000-0000-0000-000000000000:k-1"
        );
        assert_ne!(receipt_key("acme", id, "k-1"), receipt_key("globex", id, "k-1"));
    }
}
