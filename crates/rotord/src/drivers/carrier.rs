//! Carrier profiles for PPP dialing.
//!
//! Lookup is best effort: a configured APN that matches a known profile
//! wins, then the longest MCC/MNC prefix of the SIM's IMSI, then the
//! generic default. Several MVNOs share network codes with their host
//! carrier, so an IMSI match can pick the host's profile.

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppAuth {
    None,
    Pap,
    Chap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierProfile {
    pub name: &'static str,
    pub apn: String,
    pub user: &'static str,
    pub password: &'static str,
    pub auth: PppAuth,
    /// MCC+MNC prefixes of the IMSI
    pub imsi_prefixes: &'static [&'static str],
}

struct ProfileRow {
    name: &'static str,
    apn: &'static str,
    user: &'static str,
    password: &'static str,
    auth: PppAuth,
    imsi_prefixes: &'static [&'static str],
}

const PROFILES: &[ProfileRow] = &[
    ProfileRow {
        name: "EE",
        apn: "everywhere",
        user: "eesecure",
        password: "secure",
        auth: PppAuth::Chap,
        imsi_prefixes: &["23430", "23433"],
    },
    ProfileRow {
        name: "Vodafone UK",
        apn: "pp.vodafone.co.uk",
        user: "wap",
        password: "wap",
        auth: PppAuth::Chap,
        imsi_prefixes: &["23415"],
    },
    ProfileRow {
        name: "O2 UK",
        apn: "mobile.o2.co.uk",
        user: "o2web",
        password: "password",
        auth: PppAuth::Pap,
        imsi_prefixes: &["23410"],
    },
    ProfileRow {
        name: "giffgaff",
        apn: "giffgaff.com",
        user: "gg",
        password: "p",
        auth: PppAuth::Pap,
        imsi_prefixes: &[],
    },
    ProfileRow {
        name: "Three UK",
        apn: "three.co.uk",
        user: "",
        password: "",
        auth: PppAuth::None,
        imsi_prefixes: &["23420"],
    },
    ProfileRow {
        name: "T-Mobile US",
        apn: "fast.t-mobile.com",
        user: "",
        password: "",
        auth: PppAuth::None,
        imsi_prefixes: &["310260"],
    },
    ProfileRow {
        name: "AT&T",
        apn: "broadband",
        user: "",
        password: "",
        auth: PppAuth::None,
        imsi_prefixes: &["310410"],
    },
    ProfileRow {
        name: "Verizon",
        apn: "vzwinternet",
        user: "",
        password: "",
        auth: PppAuth::None,
        imsi_prefixes: &["311480"],
    },
];

impl ProfileRow {
    fn to_profile(&self) -> CarrierProfile {
        CarrierProfile {
            name: self.name,
            apn: self.apn.to_string(),
            user: self.user,
            password: self.password,
            auth: self.auth,
            imsi_prefixes: self.imsi_prefixes,
        }
    }
}

impl CarrierProfile {
    /// Generic profile; also carries an unknown configured APN
    pub fn default_for(apn: &str) -> Self {
        Self {
            name: "default",
            apn: if apn.is_empty() {
                "internet".to_string()
            } else {
                apn.to_string()
            },
            user: "",
            password: "",
            auth: PppAuth::None,
            imsi_prefixes: &[],
        }
    }

    pub fn needs_auth(&self) -> bool {
        self.auth != PppAuth::None && !self.user.is_empty()
    }
}

/// Pull the IMSI out of an `AT+CIMI` response
pub fn parse_imsi(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .find(|line| (14..=15).contains(&line.len()) && line.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Resolve the profile for a configured APN and an optional IMSI
pub fn resolve(apn: &str, imsi: Option<&str>) -> CarrierProfile {
    let apn = apn.trim();

    if !apn.is_empty() {
        if let Some(row) = PROFILES.iter().find(|p| p.apn.eq_ignore_ascii_case(apn)) {
            debug!("  Carrier {} matched by APN", row.name);
            return row.to_profile();
        }
    }

    if let Some(imsi) = imsi {
        let best = PROFILES
            .iter()
            .flat_map(|row| row.imsi_prefixes.iter().map(move |prefix| (row, *prefix)))
            .filter(|(_, prefix)| imsi.starts_with(prefix))
            .max_by_key(|(_, prefix)| prefix.len());

        if let Some((row, _)) = best {
            debug!("  Carrier {} matched by IMSI", row.name);
            let mut profile = row.to_profile();
            // an explicit APN beats the table default
            if !apn.is_empty() {
                profile.apn = apn.to_string();
            }
            return profile;
        }
    }

    warn!("  No carrier profile matched, using default (APN '{}')", if apn.is_empty() { "internet" } else { apn });
    CarrierProfile::default_for(apn)
}
