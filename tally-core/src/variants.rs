use tally_types::artifacts::ClusterData;

use lazy_static::lazy_static;
use regex::Regex;

use std::collections::{BTreeSet, HashSet};

/// Classifies job runs along independent taxonomies. Implementations are
/// pure: the same inputs always produce the same variants.
pub trait VariantClassifier: Send + Sync {
    /// The sorted variant set of a job.
    fn identify_variants(&self, job_name: &str, release: &str, cluster_data: &ClusterData) -> Vec<String>;
    fn is_job_never_stable(&self, job_name: &str) -> bool;
    fn all_variants(&self) -> BTreeSet<String>;
    fn all_platforms(&self) -> BTreeSet<String>;
}

/// For fleets whose job names carry no variant information.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoVariants;

impl VariantClassifier for NoVariants {
    fn identify_variants(&self, _: &str, _: &str, _: &ClusterData) -> Vec<String> {
        Vec::new()
    }

    fn is_job_never_stable(&self, _: &str) -> bool {
        false
    }

    fn all_variants(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn all_platforms(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

struct Rule {
    pattern: Regex,
    variant: &'static str,
}

fn rules(table: &[(&str, &'static str)]) -> Vec<Rule> {
    table
        .iter()
        .map(|(tokens, variant)| Rule {
            // Tokens are delimited by dashes inside job names.
            pattern: Regex::new(&format!("(?:^|-)(?:{})(?:-|$)", tokens)).unwrap(),
            variant,
        })
        .collect()
}

const PLATFORMS: &[(&str, &str)] = &[
    ("alibaba", "alibaba"),
    ("aws", "aws"),
    ("azure", "azure"),
    ("gcp", "gcp"),
    ("ibmcloud", "ibmcloud"),
    ("libvirt", "libvirt"),
    ("metal|metal-ipi|baremetal", "metal"),
    ("nutanix", "nutanix"),
    ("openstack", "openstack"),
    ("ovirt", "ovirt"),
    ("vsphere", "vsphere"),
];

const ARCHITECTURES: &[(&str, &str)] = &[
    ("arm64|aarch64", "arm64"),
    ("ppc64le", "ppc64le"),
    ("s390x", "s390x"),
];

const NETWORKS: &[(&str, &str)] = &[("ovn", "ovn"), ("sdn", "sdn")];

const TOPOLOGIES: &[(&str, &str)] = &[("single-node|sno", "single-node"), ("compact", "compact")];

const FEATURES: &[(&str, &str)] = &[
    ("upgrade", "upgrade"),
    ("serial", "serial"),
    ("techpreview|tech-preview", "techpreview"),
    ("fips", "fips"),
    ("proxy", "proxy"),
    ("rt|realtime", "realtime"),
];

const DEFAULT_ARCHITECTURE: &str = "amd64";
const DEFAULT_TOPOLOGY: &str = "ha";

lazy_static! {
    static ref PLATFORM_RULES: Vec<Rule> = rules(PLATFORMS);
    static ref ARCHITECTURE_RULES: Vec<Rule> = rules(ARCHITECTURES);
    static ref NETWORK_RULES: Vec<Rule> = rules(NETWORKS);
    static ref TOPOLOGY_RULES: Vec<Rule> = rules(TOPOLOGIES);
    static ref FEATURE_RULES: Vec<Rule> = rules(FEATURES);
    static ref RELEASE: Regex = Regex::new(r"(?:^|-)(\d+\.\d+)(?:-|$)").unwrap();
}

fn first_match(rules: &[Rule], job_name: &str) -> Option<&'static str> {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(job_name))
        .map(|rule| rule.variant)
}

/// The first `N.M` version token of a job name.
pub fn release_from_job_name(job_name: &str) -> Option<String> {
    RELEASE
        .captures(job_name)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Clusters default to OVN networking from 4.12 on.
fn default_network(release: &str) -> Option<&'static str> {
    let (major, minor) = release.split_once('.')?;
    let version = (major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?);
    Some(if version >= (4, 12) { "ovn" } else { "sdn" })
}

fn normalized(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase)
}

/// Reads variants out of dash-separated job names. Values reported by the
/// cluster itself take precedence over those guessed from the name.
#[derive(Clone, Debug, Default)]
pub struct JobNameVariants {
    never_stable: HashSet<String>,
}

impl JobNameVariants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_never_stable<I: IntoIterator<Item = String>>(mut self, jobs: I) -> Self {
        self.never_stable.extend(jobs);
        self
    }
}

impl VariantClassifier for JobNameVariants {
    fn identify_variants(&self, job_name: &str, release: &str, cluster_data: &ClusterData) -> Vec<String> {
        let name = job_name.to_lowercase();
        let mut variants = BTreeSet::new();

        if let Some(platform) = normalized(&cluster_data.platform)
            .or_else(|| first_match(&PLATFORM_RULES, &name).map(String::from))
        {
            variants.insert(platform);
        }
        variants.insert(
            normalized(&cluster_data.architecture)
                .or_else(|| first_match(&ARCHITECTURE_RULES, &name).map(String::from))
                .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string()),
        );
        if let Some(network) = normalized(&cluster_data.network).or_else(|| {
            first_match(&NETWORK_RULES, &name)
                .or_else(|| default_network(release))
                .map(String::from)
        }) {
            variants.insert(network);
        }
        variants.insert(
            normalized(&cluster_data.topology)
                .or_else(|| first_match(&TOPOLOGY_RULES, &name).map(String::from))
                .unwrap_or_else(|| DEFAULT_TOPOLOGY.to_string()),
        );
        for rule in FEATURE_RULES.iter() {
            if rule.pattern.is_match(&name) {
                variants.insert(rule.variant.to_string());
            }
        }

        variants.into_iter().collect()
    }

    fn is_job_never_stable(&self, job_name: &str) -> bool {
        self.never_stable.contains(job_name)
    }

    fn all_variants(&self) -> BTreeSet<String> {
        [PLATFORMS, ARCHITECTURES, NETWORKS, TOPOLOGIES, FEATURES]
            .iter()
            .flat_map(|table| table.iter().map(|(_, variant)| variant.to_string()))
            .chain([DEFAULT_ARCHITECTURE.to_string(), DEFAULT_TOPOLOGY.to_string()])
            .collect()
    }

    fn all_platforms(&self) -> BTreeSet<String> {
        PLATFORMS.iter().map(|(_, platform)| platform.to_string()).collect()
    }
}
