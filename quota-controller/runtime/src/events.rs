use crate::k8s::{Api, Client, DeleteParams, Event, ListParams, PostParams, ResourceExt};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

/// Label identifying the component that published an event.
pub const EVENT_SOURCE_LABEL: &str = "clusterquota.io/event-source";

const REPORTING_COMPONENT: &str = "cluster-quota-webhook";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventSource {
    /// Events published by the usage reconciler.
    Controller,

    /// Events published by the admission webhook.
    Webhook,
}

/// Periodically deletes old events published by either source.
#[derive(Clone)]
pub struct Sweeper {
    client: Client,
    retention: Duration,
    interval: Duration,
}

/// Publishes an event for each quota denial.
#[derive(Clone)]
pub struct Recorder {
    client: Client,
    instance: String,
}

/// The object a denied request was for.
#[derive(Clone, Debug)]
pub struct Denied {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub message: String,
}

// === impl EventSource ===

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Webhook => "webhook",
        }
    }

    fn selector(&self) -> String {
        format!("{EVENT_SOURCE_LABEL}={}", self.as_str())
    }
}

// === impl Sweeper ===

impl Sweeper {
    pub fn new(client: Client, retention: Duration, interval: Duration) -> Self {
        Self {
            client,
            retention,
            interval,
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval(self.interval);
        loop {
            interval.tick().await;
            for source in [EventSource::Controller, EventSource::Webhook] {
                match self.sweep(source).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(source = source.as_str(), deleted, "Swept events"),
                    Err(error) => warn!(source = source.as_str(), %error, "Failed to sweep events"),
                }
            }
        }
    }

    async fn sweep(&self, source: EventSource) -> Result<usize> {
        let api = Api::<Event>::all(self.client.clone());
        let events = api
            .list(&ListParams::default().labels(&source.selector()))
            .await?;

        let now = Utc::now();
        let mut deleted = 0;
        for event in expired(&events.items, now, self.retention) {
            let ns = event.namespace().unwrap_or_default();
            let name = event.name_any();
            let api = Api::<Event>::namespaced(self.client.clone(), &ns);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(rsp)) if rsp.code == 404 => {}
                Err(error) => return Err(error.into()),
            }
            debug!(%ns, %name, "Deleted event");
        }
        Ok(deleted)
    }
}

fn expired<'e>(
    events: &'e [Event],
    now: DateTime<Utc>,
    retention: Duration,
) -> impl Iterator<Item = &'e Event> {
    events.iter().filter(move |event| {
        let Some(at) = last_seen(event) else {
            return false;
        };
        now.signed_duration_since(at)
            .to_std()
            .is_ok_and(|age| age > retention)
    })
}

/// The most recent time recorded on an event.
fn last_seen(event: &Event) -> Option<DateTime<Utc>> {
    [
        timestamp(&event.last_timestamp),
        timestamp(&event.event_time),
        timestamp(&event.first_timestamp),
        timestamp(&event.metadata.creation_timestamp),
    ]
    .into_iter()
    .flatten()
    .max()
}

fn timestamp<T: Serialize>(time: &Option<T>) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time.as_ref()?).ok()?;
    let t = DateTime::parse_from_rfc3339(value.as_str()?).ok()?;
    Some(t.with_timezone(&Utc))
}

// === impl Recorder ===

impl Recorder {
    pub fn new(client: Client, instance: String) -> Self {
        Self { client, instance }
    }

    /// Publishes a denial event in the background.
    pub fn denied(&self, denied: Denied) {
        let client = self.client.clone();
        let event = match denial_event(&denied, &self.instance, Utc::now()) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "Failed to build denial event");
                return;
            }
        };
        tokio::spawn(async move {
            let api = Api::<Event>::namespaced(client, &denied.namespace);
            if let Err(error) = api.create(&PostParams::default(), &event).await {
                warn!(%error, ns = %denied.namespace, name = %denied.name, "Failed to publish denial event");
            }
        });
    }
}

fn denial_event(denied: &Denied, instance: &str, now: DateTime<Utc>) -> serde_json::Result<Event> {
    let now = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "generateName": format!("{}.", denied.name),
            "namespace": denied.namespace,
            "labels": { EVENT_SOURCE_LABEL: EventSource::Webhook.as_str() },
        },
        "involvedObject": {
            "apiVersion": denied.api_version,
            "kind": denied.kind,
            "namespace": denied.namespace,
            "name": denied.name,
        },
        "reason": "QuotaExceeded",
        "message": denied.message,
        "type": "Warning",
        "count": 1,
        "firstTimestamp": now,
        "lastTimestamp": now,
        "source": { "component": REPORTING_COMPONENT },
        "reportingComponent": REPORTING_COMPONENT,
        "reportingInstance": instance,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, last_seen: &str) -> Event {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name,
                "namespace": "ns-a",
                "labels": { EVENT_SOURCE_LABEL: "controller" },
            },
            "involvedObject": { "kind": "Pod", "name": "p" },
            "lastTimestamp": last_seen,
        }))
        .unwrap()
    }

    #[test]
    fn sources_select_distinct_events() {
        assert_eq!(
            EventSource::Controller.selector(),
            "clusterquota.io/event-source=controller"
        );
        assert_eq!(
            EventSource::Webhook.selector(),
            "clusterquota.io/event-source=webhook"
        );
    }

    #[test]
    fn only_old_events_expire() {
        let now = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let events = vec![
            event("old", "2024-06-01T10:00:00Z"),
            event("recent", "2024-06-01T11:30:00Z"),
            serde_json::from_value(serde_json::json!({
                "metadata": { "name": "undated" },
                "involvedObject": {},
            }))
            .unwrap(),
        ];
        let names = expired(&events, now, Duration::from_secs(3600))
            .map(|e| e.name_any())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["old"]);
    }

    #[test]
    fn denial_events_carry_the_webhook_source() {
        let now = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = denial_event(
            &Denied {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                namespace: "ns-a".to_string(),
                name: "web".to_string(),
                message: "exceeded quota: team-a".to_string(),
            },
            "webhook-0",
            now,
        )
        .unwrap();

        assert_eq!(event.metadata.generate_name.as_deref(), Some("web."));
        assert_eq!(
            event.labels().get(EVENT_SOURCE_LABEL).map(String::as_str),
            Some("webhook")
        );
        assert_eq!(event.involved_object.name.as_deref(), Some("web"));
        assert_eq!(event.reason.as_deref(), Some("QuotaExceeded"));
        assert_eq!(last_seen(&event), Some(now));
    }
}
