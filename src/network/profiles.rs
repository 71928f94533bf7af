//! Named network profiles and dynamic scenarios understood by the media server.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub name: &'static str,
    pub packet_loss: f64,
    pub latency_ms: u32,
    /// 0 means unlimited.
    pub bandwidth_kbps: u32,
}

const fn profile(name: &'static str, packet_loss: f64, latency_ms: u32, bandwidth_kbps: u32) -> Profile {
    Profile {
        name,
        packet_loss,
        latency_ms,
        bandwidth_kbps,
    }
}

pub const PROFILES: &[Profile] = &[
    profile("perfect", 0.0, 0, 0),
    profile("3g", 2.0, 300, 384),
    profile("4g", 0.5, 50, 12_000),
    profile("5g", 0.1, 10, 100_000),
    profile("wifi", 0.5, 20, 54_000),
    profile("public", 1.0, 40, 10_000),
    profile("satellite", 3.0, 600, 1_000),
    profile("broadband", 0.01, 5, 100_000),
    profile("poor", 10.0, 500, 50),
    profile("drone-urban", 5.0, 100, 5_000),
    profile("drone-mountain", 15.0, 200, 1_000),
    profile("noisy-radio", 8.0, 150, 2_000),
];

/// Time-varying conditions the server can play out by itself.
pub const SCENARIOS: &[(&str, &str)] = &[
    ("degrading", "Network conditions gradually worsen over time"),
    ("flaky", "Intermittent connection drops"),
    ("congestion", "Bandwidth drops during peak times"),
    ("intermittent-satellite", "Periodic satellite link disconnections"),
    ("noisy-radio", "UHF/VHF radio with interference"),
    ("drone-urban", "Drone flying through urban environment"),
    ("drone-mountain", "Drone in mountainous terrain"),
];

pub fn lookup(name: &str) -> Option<Profile> {
    PROFILES
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .copied()
}

pub fn is_known_scenario(name: &str) -> bool {
    SCENARIOS.iter().any(|(s, _)| s.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_found_case_insensitively() {
        let poor = lookup("POOR").expect("poor profile");
        assert_eq!(poor.packet_loss, 10.0);
        assert_eq!(poor.latency_ms, 500);
        assert!(lookup("carrier-pigeon").is_none());
    }

    #[test]
    fn scenarios_are_recognised() {
        assert!(is_known_scenario("degrading"));
        assert!(!is_known_scenario("calm"));
    }
}
