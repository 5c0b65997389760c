//! Declarative site profiles.
//!
//! A source URL is classified once against [`PROFILES`]; the matching profile
//! supplies the referer, extra request headers, the ordered extractor chain
//! and whether the site serves audio and video as separate renditions.

use serde::Serialize;
use url::Url;

use crate::loader::RequestHeaders;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteCategory {
    VideoPlatform,
    Adult,
    Generic,
}

/// Extraction capabilities, in the order a profile wants them tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    /// Platform metadata via the primary download tool.
    Platform,
    /// Player configuration embedded in page scripts.
    PageScript,
    /// Coarse scan of everything the page references.
    PageScan,
}

impl ExtractorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::PageScript => "page-script",
            Self::PageScan => "page-scan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteProfile {
    pub name: &'static str,
    pub category: SiteCategory,
    /// Hostnames matched exactly or as a dot-suffix (`www.` and CDN subdomains).
    pub hosts: &'static [&'static str],
    /// Fixed referer. When `None` the source page's origin is used.
    pub referer: Option<&'static str>,
    pub extra_headers: &'static [(&'static str, &'static str)],
    pub extractors: &'static [ExtractorKind],
    pub separate_av: bool,
}

impl SiteProfile {
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.hosts.iter().any(|h| {
            host == *h
                || host
                    .strip_suffix(h)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Headers for requests made on behalf of a page from this site.
    pub fn request_headers(&self, user_agent: &str, source: &Url) -> RequestHeaders {
        let referer = match self.referer {
            Some(r) => r.to_string(),
            None => origin_referer(source),
        };
        let mut headers = RequestHeaders::new(user_agent).with_referer(referer);
        for (name, value) in self.extra_headers {
            headers = headers.with_header(*name, *value);
        }
        headers
    }
}

use ExtractorKind::{PageScan, PageScript, Platform};

pub static GENERIC: SiteProfile = SiteProfile {
    name: "generic",
    category: SiteCategory::Generic,
    hosts: &[],
    referer: None,
    extra_headers: &[],
    extractors: &[PageScript, PageScan],
    separate_av: false,
};

pub static PROFILES: &[SiteProfile] = &[
    SiteProfile {
        name: "youtube",
        category: SiteCategory::VideoPlatform,
        hosts: &["youtube.com", "youtu.be", "youtube-nocookie.com"],
        referer: Some("https://www.youtube.com/"),
        extra_headers: &[],
        extractors: &[Platform, PageScan],
        separate_av: true,
    },
    SiteProfile {
        name: "vimeo",
        category: SiteCategory::VideoPlatform,
        hosts: &["vimeo.com"],
        referer: Some("https://vimeo.com/"),
        extra_headers: &[],
        extractors: &[Platform, PageScript, PageScan],
        separate_av: false,
    },
    SiteProfile {
        name: "dailymotion",
        category: SiteCategory::VideoPlatform,
        hosts: &["dailymotion.com", "dai.ly"],
        referer: Some("https://www.dailymotion.com/"),
        extra_headers: &[],
        extractors: &[Platform, PageScan],
        separate_av: false,
    },
    SiteProfile {
        name: "pornhub",
        category: SiteCategory::Adult,
        hosts: &["pornhub.com", "phncdn.com"],
        referer: Some("https://www.pornhub.com/"),
        extra_headers: &[("Accept-Language", "en-US,en;q=0.9")],
        extractors: &[PageScript, Platform, PageScan],
        separate_av: true,
    },
    SiteProfile {
        name: "xvideos",
        category: SiteCategory::Adult,
        hosts: &["xvideos.com", "xvideos-cdn.com"],
        referer: Some("https://www.xvideos.com/"),
        extra_headers: &[],
        extractors: &[PageScript, Platform, PageScan],
        separate_av: false,
    },
    SiteProfile {
        name: "xhamster",
        category: SiteCategory::Adult,
        hosts: &["xhamster.com", "xhcdn.com"],
        referer: Some("https://xhamster.com/"),
        extra_headers: &[],
        extractors: &[PageScript, Platform, PageScan],
        separate_av: true,
    },
];

/// Classifies a source URL. Unknown hosts get the generic profile.
pub fn classify(url: &Url) -> &'static SiteProfile {
    url.host_str()
        .and_then(profile_for_domain)
        .unwrap_or(&GENERIC)
}

pub fn profile_for_domain(domain: &str) -> Option<&'static SiteProfile> {
    PROFILES.iter().find(|p| p.matches_host(domain))
}

/// Referer to present when fetching a resource hosted on `domain`.
pub fn referer_for_domain(domain: &str) -> String {
    match profile_for_domain(domain).and_then(|p| p.referer) {
        Some(r) => r.to_string(),
        None => format!("https://{}/", domain),
    }
}

fn origin_referer(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}
