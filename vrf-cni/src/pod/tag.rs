use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha512};

use super::PodNetworkSpec;
use crate::dataplane::{IpFamily, MAX_API_TAG_LEN};

/// Base64 characters of the hash kept in a tag. They stay intact when the
/// readable part is truncated.
const TAG_HASH_LEN: usize = 8;

fn hash(parts: &[&str]) -> String {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let mut encoded = STANDARD.encode(hasher.finalize());
    encoded.truncate(TAG_HASH_LEN);
    encoded
}

fn truncate(mut tag: String) -> String {
    if tag.len() > MAX_API_TAG_LEN {
        let mut end = MAX_API_TAG_LEN;
        while !tag.is_char_boundary(end) {
            end -= 1;
        }
        tag.truncate(end);
    }
    tag
}

fn netns_basename(netns: &str) -> &str {
    Path::new(netns)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(netns)
}

impl PodNetworkSpec {
    /// Tag for a VRF owned by this pod. `suffix` separates VRF roles, e.g.
    /// `"RPF"`.
    pub fn vrf_tag(&self, family: IpFamily, suffix: &str) -> String {
        let h = hash(&[
            family.short_str(),
            &self.netns_name,
            &self.interface_name,
            suffix,
        ]);
        truncate(format!(
            "{h}-{}-{}{suffix}-{}",
            family.short_str(),
            self.interface_name,
            netns_basename(&self.netns_name)
        ))
    }

    pub fn interface_tag(&self, prefix: &str) -> String {
        let h = hash(&[prefix, &self.netns_name, &self.interface_name]);
        truncate(format!(
            "{h}-{}-{}",
            self.interface_name,
            netns_basename(&self.netns_name)
        ))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn vrf_tag_layout() {
        let spec = PodNetworkSpec::new("eth0", "/var/run/netns/cni-1234");
        let tag = spec.vrf_tag(IpFamily::V4, "");
        let (h, rest) = tag.split_at(TAG_HASH_LEN);
        assert_eq!(h.len(), TAG_HASH_LEN);
        assert_eq!(rest, "-4-eth0-cni-1234");

        let rpf = spec.vrf_tag(IpFamily::V6, "RPF");
        assert!(rpf.ends_with("-6-eth0RPF-cni-1234"));
        assert_ne!(tag[..TAG_HASH_LEN], rpf[..TAG_HASH_LEN]);
    }

    #[test]
    fn interface_tag_depends_on_prefix() {
        let spec = PodNetworkSpec::new("eth0", "/var/run/netns/cni-1234");
        let tun = spec.interface_tag("tun");
        let memif = spec.interface_tag("memif");
        assert_ne!(tun, memif);
        assert!(tun.ends_with("-eth0-cni-1234"));
    }

    #[test]
    fn long_names_are_truncated_on_char_boundary() {
        let spec = PodNetworkSpec::new("é".repeat(40), "/run/netns/ñ");
        let tag = spec.vrf_tag(IpFamily::V4, "RPF");
        assert!(tag.len() <= MAX_API_TAG_LEN);
        assert!(tag.len() >= MAX_API_TAG_LEN - 1);
    }

    #[test]
    fn concatenation_does_not_collide() {
        let a = PodNetworkSpec::new("b", "/run/netns/a");
        let b = PodNetworkSpec::new("", "/run/netns/ab");
        assert_ne!(
            a.vrf_tag(IpFamily::V4, "")[..TAG_HASH_LEN],
            b.vrf_tag(IpFamily::V4, "")[..TAG_HASH_LEN]
        );
    }

    proptest! {
        #[test]
        fn tags_are_bounded_and_distinct(
            iface in "[a-z0-9]{1,40}",
            netns in "/[a-z0-9/]{1,80}",
            other_iface in "[a-z0-9]{1,40}",
        ) {
            prop_assume!(iface != other_iface);
            let a = PodNetworkSpec::new(iface, netns.clone());
            let b = PodNetworkSpec::new(other_iface, netns);
            for family in IpFamily::ALL {
                for suffix in ["", "RPF"] {
                    let ta = a.vrf_tag(family, suffix);
                    prop_assert!(ta.len() <= MAX_API_TAG_LEN);
                    prop_assert_ne!(ta, b.vrf_tag(family, suffix));
                }
            }
            prop_assert_ne!(a.vrf_tag(IpFamily::V4, ""), a.vrf_tag(IpFamily::V6, ""));
            prop_assert_ne!(a.vrf_tag(IpFamily::V4, ""), a.vrf_tag(IpFamily::V4, "RPF"));
        }
    }
}
