use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use log::debug;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Placeholder for listing fields the marketplace left out.
pub const NOT_AVAILABLE: &str = "N/A";

/// One saved search ("bevakning") as reported by the marketplace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedSearch {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub total_count: u64,

    #[serde(default)]
    pub new_count: u64,
}

/// Counters kept for a single saved search across polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchState {
    pub id: String,
    pub name: String,
    pub last_total_count: u64,
    pub last_new_count: u64,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub last_check: DateTime<Utc>,
    pub new_items_since_start: u64,
    pub total_items_seen: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Price {
    pub value: Option<serde_json::Number>,
    pub suffix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Image {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub id: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub order: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Advertiser {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// The `ad` object of a listing. Every field is optional; the accessors on
/// [`Listing`] substitute [`NOT_AVAILABLE`] where a value is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ad {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub ad_id: Option<String>,
    pub subject: Option<String>,
    pub price: Option<Price>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub zipcode: Option<String>,
    pub list_time: Option<String>,
    pub ad_status: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
    pub advertiser: Option<Advertiser>,
    pub share_url: Option<String>,
}

/// A listing returned by the marketplace, validated at the archive boundary.
///
/// `payload` is the record exactly as received; `ad` is the typed view of
/// its `ad` object used for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub ad_id: String,
    pub ad: Ad,
    pub payload: Map<String, Value>,
}

impl Listing {
    /// Returns `None` when the record is not an object or carries no usable `ad.ad_id`.
    ///
    /// Fields of the `ad` object that fail to parse fall back to their
    /// defaults instead of rejecting the whole record.
    pub fn from_payload(payload: Value) -> Option<Self> {
        let Value::Object(mut payload) = payload else {
            return None;
        };
        let ad_id = extract_ad_id(&payload)?;
        payload.remove("discovered_at");

        let ad = payload
            .get("ad")
            .cloned()
            .and_then(|raw| match serde_json::from_value::<Ad>(raw) {
                Ok(ad) => Some(ad),
                Err(e) => {
                    debug!("ad {} has malformed fields, using defaults: {}", ad_id, e);
                    None
                }
            })
            .unwrap_or_default();

        Some(Self { ad_id, ad, payload })
    }

    pub fn title(&self) -> &str {
        self.ad.subject.as_deref().unwrap_or(NOT_AVAILABLE)
    }

    pub fn price_label(&self) -> String {
        let price = self.ad.price.clone().unwrap_or_default();
        let value = price
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        format!("{} {}", value, price.suffix.unwrap_or_default())
            .trim_end()
            .to_string()
    }

    pub fn location(&self) -> &str {
        self.ad.zipcode.as_deref().unwrap_or(NOT_AVAILABLE)
    }

    pub fn listed_at(&self) -> &str {
        self.ad.list_time.as_deref().unwrap_or(NOT_AVAILABLE)
    }

    pub fn status(&self) -> &str {
        self.ad.ad_status.as_deref().unwrap_or(NOT_AVAILABLE)
    }

    pub fn seller(&self) -> String {
        let advertiser = self.ad.advertiser.clone().unwrap_or_default();
        format!(
            "{} ({})",
            advertiser.name.as_deref().unwrap_or(NOT_AVAILABLE),
            advertiser.kind.as_deref().unwrap_or(NOT_AVAILABLE)
        )
    }

    pub fn image_urls(&self) -> impl Iterator<Item = &str> {
        self.ad.images.iter().filter_map(|img| img.url.as_deref())
    }
}

/// A listing as stored in the archive: the original payload plus the time
/// it was first seen for its search.
///
/// `discovered_at` is `None` when the stored value could not be read; the
/// raw value then stays in `payload` and is written back unchanged.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArchivedListing {
    #[serde(flatten)]
    pub payload: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_at: Option<DateTime<Utc>>,
}

impl ArchivedListing {
    /// Read one archived entry. Only non-objects are rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut payload) = value else {
            return None;
        };

        let discovered_at = match payload.remove("discovered_at") {
            Some(Value::String(raw)) => match parse_timestamp(&raw) {
                Some(ts) => Some(ts),
                None => {
                    payload.insert("discovered_at".to_string(), Value::String(raw));
                    None
                }
            },
            Some(other) => {
                payload.insert("discovered_at".to_string(), other);
                None
            }
            None => None,
        };

        Some(Self {
            payload,
            discovered_at,
        })
    }

    pub fn ad_id(&self) -> Option<String> {
        extract_ad_id(&self.payload)
    }
}

fn extract_ad_id(payload: &Map<String, Value>) -> Option<String> {
    match payload.get("ad")?.get("ad_id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses RFC 3339 timestamps, and naive ISO-8601 timestamps (local time)
/// as written by earlier versions of the monitor.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp `{}`", raw)))
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    optional_string_or_number(deserializer)?
        .ok_or_else(|| D::Error::custom("expected a string or number identifier"))
}

fn optional_string_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(D::Error::custom(format!(
                "expected a string or number, got {}",
                other
            )))
        }
    })
}
