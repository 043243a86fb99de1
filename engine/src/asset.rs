//! A single schedulable playlist entry and its activation lifecycle.
//!
//! Each asset owns two [`Timer`]s: one for its pending activation date and
//! one for its pending deactivation date. The timers are driven by the
//! scheduler loop through [`Asset::poll`]; nothing here spawns tasks.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::timer::{earliest, Timer};

/// Prefix marking an asset backed by an uploaded file.
pub const FILE_SCHEME: &str = "file:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Undefined,
    Web,
    Image,
    Video,
}

/// CSS `object-fit` style hint for the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    #[default]
    Contain,
    Cover,
    Fill,
    None,
    ScaleDown,
}

/// Durations longer than a century are treated as infinite.
pub const MAX_FINITE_SECS: f64 = 100.0 * 365.0 * 86_400.0;

/// How long an asset stays current before auto-advance.
///
/// On the wire this is a number of seconds (`0` or `null` meaning "use the
/// configured default") or the string `"infinite"`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AssetDuration {
    #[default]
    Default,
    Seconds(f64),
    Infinite,
}

impl AssetDuration {
    /// Resolve against the configured default. `None` means "never advance".
    pub fn resolve(self, default_secs: u32) -> Option<Duration> {
        match self {
            AssetDuration::Default if default_secs == 0 => None,
            AssetDuration::Default => Some(Duration::from_secs(u64::from(default_secs))),
            AssetDuration::Seconds(s) => Duration::try_from_secs_f64(s).ok(),
            AssetDuration::Infinite => None,
        }
    }

    pub fn from_secs(secs: f64) -> Result<Self, String> {
        if secs < 0.0 {
            return Err(format!("duration must be non-negative, got {secs}"));
        }
        if !secs.is_finite() || secs > MAX_FINITE_SECS {
            return Ok(AssetDuration::Infinite);
        }
        if secs == 0.0 {
            Ok(AssetDuration::Default)
        } else {
            Ok(AssetDuration::Seconds(secs))
        }
    }
}

impl Serialize for AssetDuration {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            AssetDuration::Default => s.serialize_u32(0),
            AssetDuration::Seconds(secs) => s.serialize_f64(*secs),
            AssetDuration::Infinite => s.serialize_str("infinite"),
        }
    }
}

impl<'de> Deserialize<'de> for AssetDuration {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        use serde::de::Error;
        match Option::<Raw>::deserialize(d)? {
            None => Ok(AssetDuration::Default),
            Some(Raw::Number(secs)) => AssetDuration::from_secs(secs).map_err(D::Error::custom),
            Some(Raw::Text(t)) => match t.trim().to_ascii_lowercase().as_str() {
                "infinite" | "inf" => Ok(AssetDuration::Infinite),
                "" => Ok(AssetDuration::Default),
                other => other
                    .parse::<f64>()
                    .map_err(|_| D::Error::custom(format!("invalid duration {t:?}")))
                    .and_then(|secs| AssetDuration::from_secs(secs).map_err(D::Error::custom)),
            },
        }
    }
}

/// Dates as RFC 3339, also accepting the admin form's `YYYY-MM-DDTHH:MM`
/// (taken as UTC). `null` and `""` both mean "no date".
pub mod date_format {
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime};

    pub fn parse(s: &str) -> Result<Option<OffsetDateTime>, time::error::Parse> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
            return Ok(Some(dt));
        }
        let minutes = format_description!("[year]-[month]-[day]T[hour]:[minute]");
        if let Ok(dt) = PrimitiveDateTime::parse(s, &minutes) {
            return Ok(Some(dt.assume_utc()));
        }
        let seconds = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
        PrimitiveDateTime::parse(s, &seconds).map(|dt| Some(dt.assume_utc()))
    }

    pub fn serialize<S: Serializer>(v: &Option<OffsetDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(dt) => s.serialize_str(&dt.format(&Rfc3339).map_err(S::Error::custom)?),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<OffsetDateTime>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(s) => parse(&s).map_err(D::Error::custom),
        }
    }

    /// For partial edits: absent = `None`, present (even `null`) = `Some(..)`.
    pub fn deserialize_edit<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Option<OffsetDateTime>>, D::Error> {
        deserialize(d).map(Some)
    }
}

/// For partial edits of nullable fields: absent = `None`, `null` = `Some(None)`.
pub fn deserialize_nullable<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    #[serde(default = "new_uuid")]
    uuid: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub duration: AssetDuration,
    #[serde(default)]
    enabled: bool,
    #[serde(default, with = "date_format", alias = "ena_date")]
    activation_at: Option<OffsetDateTime>,
    #[serde(default, with = "date_format", alias = "dis_date")]
    deactivation_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub fit: Fit,
    #[serde(default, alias = "bg_color")]
    pub background_color: Option<String>,

    #[serde(skip)]
    activation: Timer,
    #[serde(skip)]
    deactivation: Timer,
}

impl PartialEq for Asset {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Asset {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            uuid: new_uuid(),
            name: String::new(),
            url: url.into(),
            duration: AssetDuration::Default,
            enabled: false,
            activation_at: None,
            deactivation_at: None,
            media_type: MediaType::Undefined,
            fit: Fit::Contain,
            background_color: None,
            activation: Timer::idle(),
            deactivation: Timer::idle(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_duration(mut self, duration: AssetDuration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_activation(mut self, at: Option<OffsetDateTime>) -> Self {
        self.activation_at = at;
        self
    }

    pub fn with_deactivation(mut self, at: Option<OffsetDateTime>) -> Self {
        self.deactivation_at = at;
        self
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn activation_at(&self) -> Option<OffsetDateTime> {
        self.activation_at
    }

    pub fn deactivation_at(&self) -> Option<OffsetDateTime> {
        self.deactivation_at
    }

    /// Name of the uploaded file backing this asset, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.url.strip_prefix(FILE_SCHEME)
    }

    /// Bring the asset into a consistent state after construction or load.
    ///
    /// Dates already in the past are applied immediately and cleared, future
    /// dates arm their timer. When *both* dates are in the past (the device
    /// was off while they went by) only the later one counts; on a tie
    /// activation wins.
    pub fn settle(&mut self) {
        let now = OffsetDateTime::now_utc();
        match (self.activation_at, self.deactivation_at) {
            (Some(on), Some(off)) if on <= now && off <= now => {
                // Later date wins. The tie rule (activation) is arbitrary but
                // existing configurations depend on it.
                self.enabled = on >= off;
                self.activation_at = None;
                self.deactivation_at = None;
                self.activation.cancel();
                self.deactivation.cancel();
            }
            _ => {
                self.sync_activation(now);
                self.sync_deactivation(now);
            }
        }
    }

    /// Explicit enable. A pending activation date becomes moot.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.activation_at = None;
        self.activation.cancel();
    }

    /// Explicit disable. A pending deactivation date becomes moot.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.deactivation_at = None;
        self.deactivation.cancel();
    }

    pub fn set_activation(&mut self, at: Option<OffsetDateTime>) {
        self.activation_at = at;
        self.sync_activation(OffsetDateTime::now_utc());
    }

    pub fn set_deactivation(&mut self, at: Option<OffsetDateTime>) {
        self.deactivation_at = at;
        self.sync_deactivation(OffsetDateTime::now_utc());
    }

    fn sync_activation(&mut self, now: OffsetDateTime) {
        match self.activation_at {
            None => self.activation.cancel(),
            Some(at) if at <= now => self.enable(),
            Some(at) => self.activation.arm_at_wall(at),
        }
    }

    fn sync_deactivation(&mut self, now: OffsetDateTime) {
        match self.deactivation_at {
            None => self.deactivation.cancel(),
            Some(at) if at <= now => self.disable(),
            Some(at) => self.deactivation.arm_at_wall(at),
        }
    }

    /// Fire whichever date timers are due. Returns `true` if anything fired.
    ///
    /// When both are due in the same poll they are applied in deadline order,
    /// deactivation first on a tie so that activation is the one that sticks.
    pub fn poll(&mut self, now: Instant) -> bool {
        let on_due = self.activation.is_due(now);
        let off_due = self.deactivation.is_due(now);
        match (on_due, off_due) {
            (false, false) => false,
            (true, false) => {
                self.activation.take_due(now);
                self.enable();
                true
            }
            (false, true) => {
                self.deactivation.take_due(now);
                self.disable();
                true
            }
            (true, true) => {
                let on_first = self.activation.deadline() < self.deactivation.deadline();
                self.activation.take_due(now);
                self.deactivation.take_due(now);
                if on_first {
                    self.enable();
                    self.disable();
                } else {
                    self.disable();
                    self.enable();
                }
                true
            }
        }
    }

    /// Earliest pending date deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(self.activation.deadline(), self.deactivation.deadline())
    }

    pub fn activation_timer(&self) -> &Timer {
        &self.activation
    }

    pub fn deactivation_timer(&self) -> &Timer {
        &self.deactivation
    }
}

/// Payload accepted by `add_url`: a bare URL or a partial asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetInput {
    Url(String),
    Fields(AssetFields),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetFields {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub duration: Option<AssetDuration>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, with = "date_format", alias = "ena_date")]
    pub activation_at: Option<OffsetDateTime>,
    #[serde(default, with = "date_format", alias = "dis_date")]
    pub deactivation_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub fit: Option<Fit>,
    #[serde(default, alias = "bg_color")]
    pub background_color: Option<String>,
}

impl AssetInput {
    pub fn url(&self) -> &str {
        match self {
            AssetInput::Url(u) => u,
            AssetInput::Fields(f) => &f.url,
        }
    }

    /// Build a fresh asset (new uuid, timers not yet settled).
    pub fn into_asset(self) -> Asset {
        match self {
            AssetInput::Url(url) => Asset::new(url),
            AssetInput::Fields(f) => {
                let mut a = Asset::new(f.url);
                a.name = f.name.unwrap_or_default();
                a.duration = f.duration.unwrap_or_default();
                a.enabled = f.enabled.unwrap_or(false);
                a.activation_at = f.activation_at;
                a.deactivation_at = f.deactivation_at;
                a.media_type = f.media_type.unwrap_or_default();
                a.fit = f.fit.unwrap_or_default();
                a.background_color = f.background_color;
                a
            }
        }
    }
}

/// Partial edit of an existing asset; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetEdit {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub duration: Option<AssetDuration>,
    #[serde(default)]
    pub fit: Option<Fit>,
    #[serde(default, alias = "bg_color", deserialize_with = "deserialize_nullable")]
    pub background_color: Option<Option<String>>,
    #[serde(default, alias = "ena_date", deserialize_with = "date_format::deserialize_edit")]
    pub activation_at: Option<Option<OffsetDateTime>>,
    #[serde(default, alias = "dis_date", deserialize_with = "date_format::deserialize_edit")]
    pub deactivation_at: Option<Option<OffsetDateTime>>,
    #[serde(default, alias = "state")]
    pub enabled: Option<bool>,
}

/// `http`/`https` URL with a host.
pub fn is_valid_url(s: &str) -> bool {
    match url::Url::parse(s) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some(),
        Err(_) => false,
    }
}
