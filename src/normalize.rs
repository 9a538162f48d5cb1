//! Pure mapping from a raw storefront order payload to [`NormalizedOrder`].
//!
//! No network or database access happens here. Product images that are not
//! carried by the payload are filled in later by an [`crate::remote::ImageLookup`].

use crate::model::{LineItem, NormalizedOrder, Order};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed order payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("order {0} has no creation date")]
    MissingDate(i64),
    #[error("order {order_id} has unparsable date {value:?}")]
    BadDate { order_id: i64, value: String },
}

/// Decorative symbols sellers paste into variant labels.
const NOISE_SYMBOLS: &[char] = &['■', '□', '●', '◆', '★', '☆', '✔', '✓', '➤', '🔥'];

/// Whole variant values that are marketing copy rather than attributes.
const PROMO_PHRASES: &[&str] = &[
    "best seller",
    "hot sale",
    "hot item",
    "limited edition",
    "limited time offer",
    "free shipping",
    "buy more save more",
    "new arrival",
    "trending now",
];

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").unwrap());

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoteAddress {
    first_name: Option<String>,
    last_name: Option<String>,
    address_1: Option<String>,
    address_2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postcode: Option<String>,
    country: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteOrder {
    id: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default, deserialize_with = "money")]
    total: f64,
    #[serde(default, deserialize_with = "money")]
    shipping_total: f64,
    #[serde(default)]
    billing: Option<RemoteAddress>,
    #[serde(default)]
    shipping: Option<RemoteAddress>,
    #[serde(default)]
    payment_method_title: Option<String>,
    #[serde(default)]
    customer_note: Option<String>,
    #[serde(default)]
    date_created_gmt: Option<String>,
    #[serde(default)]
    date_created: Option<String>,
    #[serde(default)]
    date_modified_gmt: Option<String>,
    #[serde(default)]
    date_modified: Option<String>,
    #[serde(default)]
    line_items: Vec<RemoteLineItem>,
}

#[derive(Debug, Deserialize)]
struct RemoteLineItem {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    product_id: Option<i64>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    quantity: Option<i64>,
    #[serde(default, deserialize_with = "money")]
    price: f64,
    #[serde(default, deserialize_with = "money")]
    subtotal: f64,
    #[serde(default)]
    image: Option<RemoteImage>,
    #[serde(default)]
    meta_data: Vec<RemoteMeta>,
}

#[derive(Debug, Deserialize)]
struct RemoteImage {
    #[serde(default)]
    src: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteMeta {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    display_value: Option<Value>,
}

/// Storefronts send money both as `"12.50"` and `12.5`.
fn money<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0.0),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid amount {:?}", s))),
        other => Err(serde::de::Error::custom(format!("invalid amount {}", other))),
    }
}

/// Map one storefront order to the canonical shape.
pub fn normalize(raw: &Value) -> Result<NormalizedOrder, NormalizeError> {
    let remote = RemoteOrder::deserialize(raw)?;
    let id = remote.id;

    let created_raw = remote
        .date_created_gmt
        .as_deref()
        .or(remote.date_created.as_deref())
        .ok_or(NormalizeError::MissingDate(id))?;
    let created_at = parse_remote_date(id, created_raw)?;
    let modified_at = match remote
        .date_modified_gmt
        .as_deref()
        .or(remote.date_modified.as_deref())
    {
        Some(raw) => parse_remote_date(id, raw)?,
        None => created_at,
    };

    let billing = remote.billing.unwrap_or_default();
    let shipping = remote.shipping.unwrap_or_default();
    let customer_name = display_name(&billing).or_else(|| display_name(&shipping));

    let items = remote.line_items.into_iter().map(normalize_item).collect();

    Ok(NormalizedOrder {
        order: Order {
            external_order_id: id,
            status: non_empty(remote.status).unwrap_or_else(|| "unknown".to_string()),
            currency: non_empty(remote.currency).unwrap_or_default(),
            total: remote.total,
            shipping_total: remote.shipping_total,
            customer_name,
            customer_phone: non_empty(billing.phone.clone()),
            customer_email: non_empty(billing.email.clone()),
            billing_address: format_address(&billing),
            shipping_address: format_address(&shipping),
            payment_method_title: non_empty(remote.payment_method_title),
            note: non_empty(remote.customer_note),
            created_at,
            modified_at,
        },
        items,
    })
}

fn normalize_item(item: RemoteLineItem) -> LineItem {
    let quantity = item.quantity.unwrap_or(0);
    let unit_price = if item.price != 0.0 || quantity == 0 {
        item.price
    } else {
        item.subtotal / quantity as f64
    };
    let variants = item
        .meta_data
        .iter()
        .filter(|m| !m.key.starts_with('_'))
        .filter_map(|m| {
            let text = m
                .display_value
                .as_ref()
                .and_then(scalar_text)
                .or_else(|| scalar_text(&m.value))?;
            let cleaned = clean_variant_text(&text);
            (!cleaned.is_empty() && !is_promo(&cleaned)).then_some(cleaned)
        })
        .collect();

    LineItem {
        product_id: item.product_id.filter(|id| *id > 0),
        name: item.name.map(|n| n.trim().to_string()).unwrap_or_default(),
        sku: non_empty(item.sku),
        quantity,
        unit_price,
        image_url: item.image.and_then(|i| non_empty(i.src)),
        variants,
    }
}

/// Strip tags, decode entities, drop decorative symbols and squeeze whitespace.
pub fn clean_variant_text(raw: &str) -> String {
    let untagged = TAG_RE.replace_all(raw, "");
    let decoded = decode_entities(&untagged);
    let without_noise: String = decoded
        .chars()
        .filter(|c| !NOISE_SYMBOLS.contains(c))
        .collect();
    without_noise.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(s: &str) -> String {
    ENTITY_RE
        .replace_all(s, |caps: &Captures| {
            let body = &caps[1];
            let hex = body
                .strip_prefix("#x")
                .or_else(|| body.strip_prefix("#X"));
            let decoded = if let Some(hex) = hex {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(body)
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        _ => return None,
    })
}

fn is_promo(text: &str) -> bool {
    let lower = text.to_lowercase();
    let trimmed = lower.trim_matches(|c: char| !c.is_alphanumeric());
    PROMO_PHRASES.iter().any(|p| *p == trimmed)
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_remote_date(order_id: i64, raw: &str) -> Result<DateTime<Utc>, NormalizeError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|_| NormalizeError::BadDate {
            order_id,
            value: raw.to_string(),
        })
}

fn display_name(addr: &RemoteAddress) -> Option<String> {
    let first = addr.first_name.as_deref().unwrap_or("").trim();
    let last = addr.last_name.as_deref().unwrap_or("").trim();
    let name = format!("{} {}", first, last).trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn format_address(addr: &RemoteAddress) -> Option<String> {
    let field = |v: &Option<String>| v.as_deref().unwrap_or("").trim().to_string();
    let state_postcode = format!("{} {}", field(&addr.state), field(&addr.postcode))
        .trim()
        .to_string();
    let parts: Vec<String> = [
        field(&addr.address_1),
        field(&addr.address_2),
        field(&addr.city),
        state_postcode,
        field(&addr.country),
    ]
    .into_iter()
    .filter(|p| !p.is_empty())
    .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "id": 1042,
            "status": "processing",
            "currency": "USD",
            "total": "59.90",
            "shipping_total": 4.5,
            "date_created_gmt": "2024-03-01T12:00:00",
            "date_modified_gmt": "2024-03-01T12:05:30",
            "payment_method_title": "Credit Card",
            "customer_note": "  ",
            "billing": {
                "first_name": "Ann",
                "last_name": "Lee",
                "address_1": "1 Main St",
                "address_2": "",
                "city": "Springfield",
                "state": "IL",
                "postcode": "62701",
                "country": "US",
                "email": "ann@example.com",
                "phone": "555-0100"
            },
            "shipping": {
                "first_name": "Ann",
                "last_name": "Lee",
                "address_1": "9 Dock Rd",
                "city": "Portland",
                "state": "",
                "postcode": "97201",
                "country": "US"
            },
            "line_items": [{
                "name": "Classic Tee",
                "product_id": 77,
                "sku": "TEE-1",
                "quantity": 2,
                "price": 27.7,
                "image": {"src": "https://cdn.example/tee.png"},
                "meta_data": [
                    {"key": "_reduced_stock", "value": "2"},
                    {
                        "key": "pa_color",
                        "value": "red",
                        "display_value": "<strong>■ Red &amp; Blue</strong>"
                    },
                    {"key": "size", "value": "XL"},
                    {"key": "promo", "value": "🔥 Best Seller 🔥"},
                    {"key": "gift", "value": "<span>&nbsp;</span>"},
                    {"key": "bundle", "value": {"nested": true}}
                ]
            }]
        })
    }

    #[test]
    fn normalizes_order_fields() {
        let n = normalize(&payload()).unwrap();
        let o = &n.order;
        assert_eq!(o.external_order_id, 1042);
        assert_eq!(o.total, 59.90);
        assert_eq!(o.shipping_total, 4.5);
        assert_eq!(o.customer_name.as_deref(), Some("Ann Lee"));
        assert_eq!(
            o.billing_address.as_deref(),
            Some("1 Main St, Springfield, IL 62701, US")
        );
        assert_eq!(o.shipping_address.as_deref(), Some("9 Dock Rd, Portland, 97201, US"));
        assert!(o.note.is_none());
        assert_eq!(o.created_at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(o.modified_at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 30).unwrap());
    }

    #[test]
    fn variant_metadata_is_cleaned_and_filtered() {
        let n = normalize(&payload()).unwrap();
        let item = &n.items[0];
        assert_eq!(item.variants, vec!["Red & Blue".to_string(), "XL".to_string()]);
        assert_eq!(item.image_url.as_deref(), Some("https://cdn.example/tee.png"));
        assert_eq!(item.product_id, Some(77));
        assert_eq!(item.quantity, 2);
    }

    #[test]
    fn clean_variant_text_examples() {
        assert_eq!(clean_variant_text("<strong>■ Red &amp; Blue</strong>"), "Red & Blue");
        assert_eq!(clean_variant_text("Size&#58; &#x4C;"), "Size: L");
        assert_eq!(clean_variant_text("★  Gold\n Edition ✔"), "Gold Edition");
        assert_eq!(clean_variant_text("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn missing_modified_falls_back_to_created() {
        let raw = json!({"id": 5, "date_created": "2024-01-02T03:04:05", "total": 3});
        let n = normalize(&raw).unwrap();
        assert_eq!(n.order.modified_at, n.order.created_at);
        assert_eq!(n.order.total, 3.0);
        assert!(n.order.customer_name.is_none());
        assert!(n.items.is_empty());
    }

    #[test]
    fn shipping_name_is_used_when_billing_is_blank() {
        let raw = json!({
            "id": 6,
            "date_created_gmt": "2024-01-02T03:04:05",
            "billing": {"first_name": "", "last_name": ""},
            "shipping": {"first_name": "Bo", "last_name": null}
        });
        assert_eq!(normalize(&raw).unwrap().order.customer_name.as_deref(), Some("Bo"));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            normalize(&json!({"status": "x"})),
            Err(NormalizeError::Malformed(_))
        ));
        assert!(matches!(
            normalize(&json!({"id": 1})),
            Err(NormalizeError::MissingDate(1))
        ));
        assert!(matches!(
            normalize(&json!({"id": 2, "date_created_gmt": "yesterday"})),
            Err(NormalizeError::BadDate { order_id: 2, .. })
        ));
        let bad_total = json!({"id": 3, "date_created_gmt": "2024-01-01T00:00:00", "total": "abc"});
        assert!(normalize(&bad_total).is_err());
    }
}
