//! Alpaca Transport Core
//!
//! Client-side transport for the ASCOM Alpaca REST API. A single transaction
//! engine issues GET/PUT calls against a device endpoint, tags them with the
//! client and transaction identifiers, decodes the typed response envelope and
//! negotiates the camera image array transfer mode (JSON, base64 hand-off or
//! ImageBytes).

mod client;
mod connection;
mod error;
mod imagearray;
pub mod imagebytes;
mod response;
mod transaction;

#[cfg(test)]
mod test_support;

pub use client::*;
pub use connection::*;
pub use error::*;
pub use imagearray::*;
pub use response::*;
pub use transaction::*;

use std::fmt;
use std::str::FromStr;

/// Alpaca API version
pub const ALPACA_API_VERSION: u32 = 1;

/// Default Alpaca API port
pub const ALPACA_DEFAULT_PORT: u16 = 11111;

/// Alpaca device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpacaDeviceType {
    Camera,
    CoverCalibrator,
    Dome,
    FilterWheel,
    Focuser,
    ObservingConditions,
    Rotator,
    SafetyMonitor,
    Switch,
    Telescope,
}

impl AlpacaDeviceType {
    /// Path segment used in device URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            AlpacaDeviceType::Camera => "camera",
            AlpacaDeviceType::CoverCalibrator => "covercalibrator",
            AlpacaDeviceType::Dome => "dome",
            AlpacaDeviceType::FilterWheel => "filterwheel",
            AlpacaDeviceType::Focuser => "focuser",
            AlpacaDeviceType::ObservingConditions => "observingconditions",
            AlpacaDeviceType::Rotator => "rotator",
            AlpacaDeviceType::SafetyMonitor => "safetymonitor",
            AlpacaDeviceType::Switch => "switch",
            AlpacaDeviceType::Telescope => "telescope",
        }
    }

    /// Get a display name for the device type
    pub fn display_name(&self) -> &'static str {
        match self {
            AlpacaDeviceType::Camera => "Camera",
            AlpacaDeviceType::CoverCalibrator => "Cover Calibrator",
            AlpacaDeviceType::Dome => "Dome",
            AlpacaDeviceType::FilterWheel => "Filter Wheel",
            AlpacaDeviceType::Focuser => "Focuser",
            AlpacaDeviceType::ObservingConditions => "Observing Conditions",
            AlpacaDeviceType::Rotator => "Rotator",
            AlpacaDeviceType::SafetyMonitor => "Safety Monitor",
            AlpacaDeviceType::Switch => "Switch",
            AlpacaDeviceType::Telescope => "Telescope",
        }
    }
}

impl FromStr for AlpacaDeviceType {
    type Err = AlpacaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "camera" => Ok(AlpacaDeviceType::Camera),
            "covercalibrator" => Ok(AlpacaDeviceType::CoverCalibrator),
            "dome" => Ok(AlpacaDeviceType::Dome),
            "filterwheel" => Ok(AlpacaDeviceType::FilterWheel),
            "focuser" => Ok(AlpacaDeviceType::Focuser),
            "observingconditions" => Ok(AlpacaDeviceType::ObservingConditions),
            "rotator" => Ok(AlpacaDeviceType::Rotator),
            "safetymonitor" => Ok(AlpacaDeviceType::SafetyMonitor),
            "switch" => Ok(AlpacaDeviceType::Switch),
            "telescope" => Ok(AlpacaDeviceType::Telescope),
            other => Err(AlpacaError::Configuration(format!(
                "unknown device type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AlpacaDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// URL scheme of an Alpaca server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The remote resource root a client talks to.
///
/// Immutable once a client has been built from it. Discovery (or the user)
/// supplies the host and port; the device type and number select the device
/// on that server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlpacaEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub device_type: AlpacaDeviceType,
    pub device_number: u32,
}

impl AlpacaEndpoint {
    pub fn new(
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
        device_type: AlpacaDeviceType,
        device_number: u32,
    ) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            device_type,
            device_number,
        }
    }

    /// Build an endpoint from a server base URL such as `http://192.168.1.89:11111`
    pub fn from_base_url(
        base_url: &str,
        device_type: AlpacaDeviceType,
        device_number: u32,
    ) -> Result<Self, AlpacaError> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| AlpacaError::Configuration(format!("invalid base url '{}': {}", base_url, e)))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(AlpacaError::Configuration(format!(
                    "unsupported url scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| AlpacaError::Configuration(format!("base url '{}' has no host", base_url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        // The parser drops a port equal to the scheme default, so look at the
        // authority text to tell "http://host:80" from "http://host"
        let port = if has_explicit_port(base_url) {
            url.port_or_known_default().unwrap_or(ALPACA_DEFAULT_PORT)
        } else {
            ALPACA_DEFAULT_PORT
        };

        Ok(Self::new(scheme, host, port, device_type, device_number))
    }

    /// `scheme://host:port`
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }

    /// `.../api/v1/{device type}/{device number}`
    pub fn device_url(&self) -> String {
        format!(
            "{}/api/v{}/{}/{}",
            self.base_url(),
            ALPACA_API_VERSION,
            self.device_type.as_str(),
            self.device_number
        )
    }

    /// Full URL of a device member. Alpaca URLs are lower case.
    pub fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.device_url(), method.to_lowercase())
    }

    /// URL of a management API member, e.g. `apiversions`
    pub fn management_url(&self, member: &str) -> String {
        format!("{}/management/{}", self.base_url(), member.to_lowercase())
    }

    /// Get a unique identifier for this endpoint
    pub fn id(&self) -> String {
        format!(
            "alpaca:{}:{}:{}",
            self.base_url(),
            self.device_type.as_str(),
            self.device_number
        )
    }
}

impl fmt::Display for AlpacaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} at {}",
            self.device_type.display_name(),
            self.device_number,
            self.base_url()
        )
    }
}

fn has_explicit_port(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host_port)| host_port);
    match host_port.rfind(']') {
        Some(end) => host_port[end..].contains(':'),
        None => host_port.contains(':'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_url_is_lower_case() {
        let endpoint = AlpacaEndpoint::new(Scheme::Http, "192.168.1.89", 7843, AlpacaDeviceType::Focuser, 0);
        assert_eq!(
            endpoint.method_url("Position"),
            "http://192.168.1.89:7843/api/v1/focuser/0/position"
        );
    }

    #[test]
    fn test_from_base_url() {
        let endpoint =
            AlpacaEndpoint::from_base_url("https://scope.local:8443", AlpacaDeviceType::Telescope, 2).unwrap();
        assert_eq!(endpoint.scheme, Scheme::Https);
        assert_eq!(endpoint.host, "scope.local");
        assert_eq!(endpoint.port, 8443);
        assert_eq!(endpoint.device_url(), "https://scope.local:8443/api/v1/telescope/2");

        let defaulted = AlpacaEndpoint::from_base_url("http://10.0.0.5", AlpacaDeviceType::Camera, 0).unwrap();
        assert_eq!(defaulted.port, ALPACA_DEFAULT_PORT);
        let defaulted = AlpacaEndpoint::from_base_url("http://10.0.0.5/", AlpacaDeviceType::Camera, 0).unwrap();
        assert_eq!(defaulted.port, ALPACA_DEFAULT_PORT);

        assert!(AlpacaEndpoint::from_base_url("ftp://x:1", AlpacaDeviceType::Camera, 0).is_err());
        assert!(AlpacaEndpoint::from_base_url("not a url", AlpacaDeviceType::Camera, 0).is_err());
    }

    #[test]
    fn test_from_base_url_keeps_scheme_default_port() {
        let http = AlpacaEndpoint::from_base_url("http://10.0.0.5:80", AlpacaDeviceType::Camera, 0).unwrap();
        assert_eq!(http.port, 80);
        assert_eq!(http.device_url(), "http://10.0.0.5:80/api/v1/camera/0");

        let https = AlpacaEndpoint::from_base_url("https://scope.local:443/", AlpacaDeviceType::Dome, 1).unwrap();
        assert_eq!(https.port, 443);

        let ipv6 = AlpacaEndpoint::from_base_url("http://[::1]:80", AlpacaDeviceType::Focuser, 0).unwrap();
        assert_eq!(ipv6.host, "::1");
        assert_eq!(ipv6.port, 80);

        let ipv6 = AlpacaEndpoint::from_base_url("http://[::1]", AlpacaDeviceType::Focuser, 0).unwrap();
        assert_eq!(ipv6.port, ALPACA_DEFAULT_PORT);

        let credentials =
            AlpacaEndpoint::from_base_url("http://user:pw@10.0.0.5", AlpacaDeviceType::Switch, 0).unwrap();
        assert_eq!(credentials.port, ALPACA_DEFAULT_PORT);
    }

    #[test]
    fn test_ipv6_base_url() {
        let endpoint = AlpacaEndpoint::new(Scheme::Http, "::1", 11111, AlpacaDeviceType::Dome, 0);
        assert_eq!(endpoint.base_url(), "http://[::1]:11111");
        assert_eq!(endpoint.management_url("ApiVersions"), "http://[::1]:11111/management/apiversions");
    }

    #[test]
    fn test_device_type_round_trip() {
        for name in ["camera", "Telescope", "FOCUSER", "switch"] {
            let parsed: AlpacaDeviceType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name.to_lowercase());
        }
        assert!("toaster".parse::<AlpacaDeviceType>().is_err());
    }
}
