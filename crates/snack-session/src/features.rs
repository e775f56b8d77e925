//! Capability flags keyed by SDK version. This table is the sole
//! authority; no other module branches on the SDK version directly.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkFeature {
    /// Publish the bundle as a `{diff, s3url}` map instead of a single
    /// `code` string.
    MultipleFiles,
    /// Run the dependency resolution engine over user code.
    ArbitraryImports,
    /// Include the dependency map in the save manifest.
    ProjectDependencies,
}

const FEATURE_TABLE: &[(SdkFeature, SdkVersion)] = &[
    (SdkFeature::MultipleFiles, SdkVersion::new(21, 0, 0)),
    (SdkFeature::ArbitraryImports, SdkVersion::new(25, 0, 0)),
    (SdkFeature::ProjectDependencies, SdkVersion::new(25, 0, 0)),
];

pub fn supports(sdk_version: &str, feature: SdkFeature) -> bool {
    let Some(version) = SdkVersion::parse(sdk_version) else {
        return false;
    };
    FEATURE_TABLE
        .iter()
        .any(|(candidate, minimum)| *candidate == feature && version >= *minimum)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SdkVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl SdkVersion {
    const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        Some(Self::new(major, minor, patch))
    }
}
