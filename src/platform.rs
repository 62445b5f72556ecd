//! The `platform` request parameter and platform-name heuristics.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

static WINDOWS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<plain>windows)|(?P<delimited>(?:^|[/:\-\\;])win(?:[/:\-\\;]|$))")
        .expect("windows platform pattern is a valid regex")
});

/// Returns true if the platform name looks like a Windows image.
///
/// Matches `windows` anywhere, or `win` delimited by `/ : - \ ;` or the
/// string boundaries: `win-2008` and `myorg/win-2k8r2` match,
/// `myorg/winderping` does not.
pub fn is_windows(platform: &str) -> bool {
    WINDOWS_PATTERN.is_match(platform)
}

/// Windows targets are reached over WinRM, everything else over SSH.
pub fn uses_ssh(platform: &str) -> bool {
    !is_windows(platform)
}

/// Image list of a structured platform; a single string is accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Images {
    One(String),
    Many(Vec<String>),
}

impl Images {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(image) => vec![image.clone()],
            Self::Many(images) => images.clone(),
        }
    }
}

/// A cloud request spelled out by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRequest {
    #[serde(default)]
    pub cloud: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    pub images: Images,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What to provision.
///
/// Accepts a plain image name, a list of image names, a structured cloud
/// request (anything with an `images` key) or a mapping of image name to
/// instance count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Platform {
    Single(String),
    List(Vec<String>),
    Structured(CloudRequest),
    Counts(BTreeMap<String, u32>),
}

impl Platform {
    /// Image names in request order (count mappings yield each name once).
    pub fn images(&self) -> Vec<String> {
        match self {
            Self::Single(image) => vec![image.clone()],
            Self::List(images) => images.clone(),
            Self::Structured(request) => request.images.to_vec(),
            Self::Counts(counts) => counts.keys().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.images().iter().all(|i| i.trim().is_empty())
    }

    /// Image name to number of instances requested.
    pub fn resource_counts(&self) -> BTreeMap<String, u32> {
        match self {
            Self::Counts(counts) => counts.clone(),
            _ => {
                let mut counts = BTreeMap::new();
                for image in self.images() {
                    *counts.entry(image).or_insert(0) += 1;
                }
                counts
            }
        }
    }

    /// Normalizes into the `VMs` entry sent to the provision service.
    ///
    /// Plain names and lists take `cloud`, `region` and `zone` from the
    /// arguments. A structured request keeps its own values, except that a
    /// `cloud` argument overrides the one given by the caller.
    pub fn to_cloud_request(
        &self,
        cloud: Option<&str>,
        region: Option<&str>,
        zone: Option<&str>,
    ) -> Value {
        match self {
            Self::Structured(request) => {
                let mut request = request.clone();
                if let Some(cloud) = cloud {
                    request.cloud = Some(cloud.to_string());
                }
                request.images = Images::Many(request.images.to_vec());
                serde_json::to_value(request).unwrap_or(Value::Null)
            }
            _ => json!({
                "cloud": cloud,
                "region": region,
                "zone": zone,
                "images": self.images(),
            }),
        }
    }

    /// A filesystem-safe name, used for environment directories.
    pub fn slug(&self) -> String {
        self.to_string().replace(['/', ':', '\\'], "_")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.images().join(","))
    }
}

impl From<&str> for Platform {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}
