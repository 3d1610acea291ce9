//! Traefik router name decoding
//!
//! Traefik names the routers it derives from Kubernetes resources as
//! `<prefix>@<provider>`, where the prefix joins the entrypoint (Ingress only),
//! the namespace, the resource name, hostname fragments and a hash with `-`.
//!
//! Decoding is best-effort: the resource name is everything between the
//! namespace and the last hex part of at least 12 characters. Hostnames that
//! contain such a part, or hashes shorter than 12 characters, decode wrongly.
//! Callers must treat a decoded identity as a lookup key, never as truth.

use crate::{target_key, TargetKind};

const MIN_HASH_LEN: usize = 12;

/// Kubernetes target decoded from a Traefik router name
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterIdentity {
    pub namespace: String,
    pub target_name: String,
    pub kind: TargetKind,
}

impl RouterIdentity {
    pub fn decode(router_name: &str) -> Self {
        let (prefix, kind) = match router_name.split_once('@') {
            Some((prefix, provider)) => (prefix, TargetKind::from_provider(provider)),
            None => (router_name, TargetKind::Unknown),
        };

        let parts: Vec<&str> = prefix.split('-').collect();

        // Index of the first part belonging to the namespace
        let namespace_at = match kind {
            TargetKind::IngressRoute => 0,
            TargetKind::Ingress => 1,
            TargetKind::Unknown => {
                return Self {
                    kind,
                    ..Default::default()
                }
            }
        };

        let hash_at = parts
            .iter()
            .enumerate()
            .skip(namespace_at + 1)
            .rev()
            .find(|(_, part)| is_hash(part))
            .map(|(i, _)| i);

        match hash_at {
            Some(hash_at) => Self {
                namespace: parts[namespace_at].to_string(),
                target_name: parts[namespace_at + 1..hash_at].join("-"),
                kind,
            },
            None => Self {
                kind,
                ..Default::default()
            },
        }
    }

    /// All three fields are known
    pub fn is_complete(&self) -> bool {
        !self.namespace.is_empty()
            && !self.target_name.is_empty()
            && self.kind != TargetKind::Unknown
    }

    /// Config store key, if the identity is complete
    pub fn key(&self) -> Option<String> {
        self.is_complete()
            .then(|| target_key(&self.namespace, &self.target_name))
    }
}

fn is_hash(part: &str) -> bool {
    part.len() >= MIN_HASH_LEN && part.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
