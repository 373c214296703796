//! Issuer/child forest built from an unordered set of certificates.
//!
//! Certificates arrive in any order from any source; the hierarchy links
//! each one under its actual issuer when that issuer is present. Roots
//! are either self-signed, temporary orphans whose issuer may still be
//! inserted, or permanent orphans whose issuer is absent from the input
//! set. Non self-signed roots and cross-signed certificates are not
//! supported.

use std::collections::VecDeque;
use std::fmt::Write as _;

use tracing::warn;

use crate::error::{Error, Result};
use crate::types::CertificateHashData;
use crate::x509_wrapper::Certificate;

/// Link state of one hierarchy node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeState {
    pub is_self_signed: bool,
    /// Meaningful only for non self-signed roots: the issuer is known to
    /// be absent from the input set.
    pub is_permanent_orphan: bool,
}

/// One node of the forest: the certificate, its issuer-scoped hash when
/// an issuer is known, the issuer certificate and the issued children.
#[derive(Debug, Clone)]
pub struct X509Node {
    pub state: NodeState,
    pub certificate: Certificate,
    pub hash: Option<CertificateHashData>,
    /// Equal to the certificate itself for self-signed nodes, the parent
    /// certificate otherwise.
    pub issuer: Certificate,
    pub children: Vec<X509Node>,
}

/// The certificate forest. Built once from a set of certificates and then
/// queried; bundles rebuild it after any mutation.
#[derive(Debug, Clone, Default)]
pub struct CertificateHierarchy {
    hierarchy: Vec<X509Node>,
}

impl CertificateHierarchy {
    /// Build the forest from the given certificates. The outcome is
    /// independent of the input order, up to child ordering.
    pub fn build_hierarchy(certificates: Vec<Certificate>) -> Result<Self> {
        let mut built = Self::default();

        for certificate in certificates {
            built.insert(certificate)?;
        }

        built.prune()?;
        Ok(built)
    }

    /// Build the forest from a root set plus an additional leaf set.
    pub fn build_with_leaves(
        roots: Vec<Certificate>,
        leaves: Vec<Certificate>,
    ) -> Result<Self> {
        let mut built = Self::default();

        for certificate in roots.into_iter().chain(leaves) {
            built.insert(certificate)?;
        }

        built.prune()?;
        Ok(built)
    }

    /// Top-level nodes of the forest.
    pub fn roots(&self) -> &[X509Node] {
        &self.hierarchy
    }

    /// Breadth-first iteration over the whole forest, stopping when the
    /// function returns false.
    pub fn for_each<'a>(&'a self, mut func: impl FnMut(&'a X509Node) -> bool) {
        let mut queue: VecDeque<&X509Node> = VecDeque::new();

        for root in &self.hierarchy {
            if !func(root) {
                return;
            }
            for child in &root.children {
                queue.push_back(child);
            }
        }

        while let Some(node) = queue.pop_front() {
            if !func(node) {
                return;
            }
            for child in &node.children {
                queue.push_back(child);
            }
        }
    }

    /// Depth-first iteration over the descendants of `node`, excluding
    /// `node` itself.
    pub fn for_each_descendant<'a>(
        node: &'a X509Node,
        depth: i32,
        func: &mut impl FnMut(&'a X509Node, i32),
    ) {
        for child in &node.children {
            func(child, depth);

            if !child.children.is_empty() {
                Self::for_each_descendant(child, depth + 1, func);
            }
        }
    }

    /// The certificate is a self-signed root contained in this forest.
    pub fn is_internal_root(&self, certificate: &Certificate) -> bool {
        certificate.is_self_signed()
            && self
                .hierarchy
                .iter()
                .any(|node| node.certificate == *certificate)
    }

    /// All transitive children of the given certificate, in pre-order.
    pub fn collect_descendants(&self, top: &Certificate) -> Vec<Certificate> {
        let mut descendants = Vec::new();

        self.for_each(|node| {
            if node.certificate == *top {
                let mut collect = |descendant: &X509Node, _depth: i32| {
                    descendants.push(descendant.certificate.clone());
                };
                Self::for_each_descendant(node, 0, &mut collect);

                return false;
            }

            true
        });

        descendants
    }

    /// Issuer-scoped hash of the certificate: the self form for
    /// self-signed certificates, the stored issuer-bound hash otherwise.
    /// Fails when the certificate's issuer is not part of this forest.
    pub fn get_certificate_hash(&self, certificate: &Certificate) -> Result<CertificateHashData> {
        if certificate.is_self_signed() {
            return certificate.certificate_hash_data();
        }

        let mut found = None;
        self.for_each(|node| {
            if node.certificate == *certificate && node.hash.is_some() {
                found = node.hash.clone();
                return false;
            }

            true
        });

        found.ok_or_else(|| {
            warn!(
                "Could not find issuer for certificate: {}",
                certificate.common_name()
            );
            Error::NoCertificateFound(certificate.common_name())
        })
    }

    /// A node with the given hash exists in the forest.
    pub fn contains_certificate_hash(
        &self,
        hash: &CertificateHashData,
        ignore_case: bool,
    ) -> bool {
        let mut contains = false;

        self.for_each(|node| {
            if let Some(node_hash) = &node.hash {
                let matches = if ignore_case {
                    node_hash.matches_ignore_case(hash)
                } else {
                    node_hash == hash
                };

                if matches {
                    contains = true;
                    return false;
                }
            }

            true
        });

        contains
    }

    /// Self-signed ancestor of the given leaf, when the leaf is linked
    /// below one.
    pub fn find_certificate_root(&self, leaf: &Certificate) -> Option<Certificate> {
        for root in &self.hierarchy {
            if !root.state.is_self_signed {
                continue;
            }

            let mut found = false;
            let mut search = |node: &X509Node, _depth: i32| {
                if node.certificate == *leaf {
                    found = true;
                }
            };
            Self::for_each_descendant(root, 1, &mut search);

            if found {
                return Some(root.certificate.clone());
            }
        }

        None
    }

    /// One certificate with the given hash, when present.
    pub fn find_certificate(
        &self,
        hash: &CertificateHashData,
        ignore_case: bool,
    ) -> Option<Certificate> {
        let mut found = None;

        self.for_each(|node| {
            if let Some(node_hash) = &node.hash {
                let matches = if ignore_case {
                    node_hash.matches_ignore_case(hash)
                } else {
                    node_hash == hash
                };

                if matches {
                    found = Some(node.certificate.clone());
                    return false;
                }
            }

            true
        });

        found
    }

    /// Every certificate with the given hash. The same intermediate can
    /// live in multiple bundles and therefore in multiple nodes.
    pub fn find_certificates_multi(&self, hash: &CertificateHashData) -> Vec<Certificate> {
        let mut found = Vec::new();

        self.for_each(|node| {
            if node.hash.as_ref() == Some(hash) {
                found.push(node.certificate.clone());
            }

            true
        });

        found
    }

    /// Human-readable dump of the forest for trace logging.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();

        for root in &self.hierarchy {
            if root.state.is_self_signed {
                let _ = write!(out, "* [ROOT]");
            } else {
                let _ = write!(out, "+ [ORPH]");
            }
            let _ = writeln!(out, " {}", root.certificate.common_name());

            let mut dump = |node: &X509Node, depth: i32| {
                for _ in 0..depth {
                    out.push_str("---");
                }
                let _ = writeln!(out, " {}", node.certificate.common_name());
            };
            Self::for_each_descendant(root, 1, &mut dump);
        }

        out
    }

    /// Insert one certificate. A non-root without a present issuer lands
    /// at the top level as a temporary orphan.
    fn insert(&mut self, certificate: Certificate) -> Result<()> {
        if certificate.is_self_signed() {
            let hash = certificate.certificate_hash_data()?;
            let mut new_root = X509Node {
                state: NodeState {
                    is_self_signed: true,
                    is_permanent_orphan: false,
                },
                hash: Some(hash),
                issuer: certificate.clone(),
                certificate,
                children: Vec::new(),
            };

            // Adopt the temporary orphans this new root turns out to have
            // issued
            let mut index = 0;
            while index < self.hierarchy.len() {
                let (is_orphan, has_hash, is_candidate) = {
                    let node = &self.hierarchy[index];
                    (
                        !node.state.is_self_signed,
                        node.hash.is_some(),
                        !node.state.is_self_signed
                            && node.certificate.is_child(&new_root.certificate),
                    )
                };

                if is_orphan && has_hash {
                    return Err(Error::InvalidState(
                        "orphan certificate can't have a proper hash".to_string(),
                    ));
                }

                if !is_candidate {
                    index += 1;
                    continue;
                }

                let mut adopted = self.hierarchy.remove(index);
                adopted.hash = Some(
                    adopted
                        .certificate
                        .certificate_hash_data_with_issuer(&new_root.certificate)?,
                );
                adopted.state = NodeState::default();
                adopted.issuer = new_root.certificate.clone();
                new_root.children.push(adopted);
            }

            self.hierarchy.push(new_root);
            return Ok(());
        }

        // Search the forest for a link, visiting roots first and then the
        // descendants breadth-first
        for path in self.breadth_first_paths() {
            let (node_issued_by_inserted, inserted_issued_by_node, node_self_signed, node_has_hash) = {
                let node = self.node_at(&path);
                (
                    node.certificate.is_child(&certificate),
                    certificate.is_child(&node.certificate),
                    node.state.is_self_signed,
                    node.hash.is_some(),
                )
            };

            if node_issued_by_inserted {
                if node_self_signed {
                    return Err(Error::InvalidState(
                        "newly added certificate can't be the parent of a self-signed certificate"
                            .to_string(),
                    ));
                }
                if node_has_hash || path.len() > 1 {
                    return Err(Error::InvalidState(
                        "an already parented certificate can't gain a second issuer".to_string(),
                    ));
                }

                // The matched node is a top-level temporary orphan whose
                // issuer just arrived: re-parent it under the new node
                let root_index = path[0];
                let mut orphan = self.hierarchy.remove(root_index);
                orphan.hash = Some(
                    orphan
                        .certificate
                        .certificate_hash_data_with_issuer(&certificate)?,
                );
                orphan.issuer = certificate.clone();
                orphan.state = NodeState::default();

                let new_node = X509Node {
                    state: NodeState::default(),
                    hash: None,
                    issuer: certificate.clone(),
                    certificate,
                    children: vec![orphan],
                };
                self.hierarchy.insert(root_index, new_node);
                return Ok(());
            }

            if inserted_issued_by_node {
                let issuer = self.node_at(&path).certificate.clone();
                let hash = certificate.certificate_hash_data_with_issuer(&issuer)?;

                let child = X509Node {
                    state: NodeState::default(),
                    hash: Some(hash),
                    issuer,
                    certificate,
                    children: Vec::new(),
                };
                self.node_at_mut(&path).children.push(child);
                return Ok(());
            }
        }

        // No link found: keep it at the top as a temporary orphan
        let node = X509Node {
            state: NodeState::default(),
            hash: None,
            issuer: certificate.clone(),
            certificate,
            children: Vec::new(),
        };
        self.hierarchy.push(node);
        Ok(())
    }

    /// After all insertions, link every remaining temporary orphan whose
    /// issuer is now present and mark the rest as permanent orphans.
    fn prune(&mut self) -> Result<()> {
        if self.hierarchy.len() <= 1 {
            return Ok(());
        }

        let mut index = 0;
        while index < self.hierarchy.len() {
            let is_temporary_orphan = {
                let node = &self.hierarchy[index];
                !node.state.is_self_signed && !node.state.is_permanent_orphan
            };

            if !is_temporary_orphan {
                index += 1;
                continue;
            }

            let orphan = self.hierarchy.remove(index);
            let issuer_path = self
                .breadth_first_paths()
                .into_iter()
                .find(|path| orphan.certificate.is_child(&self.node_at(path).certificate));

            match issuer_path {
                Some(path) => {
                    let issuer = self.node_at(&path).certificate.clone();

                    let mut orphan = orphan;
                    orphan.hash = Some(
                        orphan
                            .certificate
                            .certificate_hash_data_with_issuer(&issuer)?,
                    );
                    orphan.state = NodeState::default();
                    orphan.issuer = issuer;

                    self.node_at_mut(&path).children.push(orphan);
                    // The element at `index` changed, re-test it
                }
                None => {
                    let mut orphan = orphan;
                    orphan.state.is_permanent_orphan = true;
                    self.hierarchy.insert(index, orphan);
                    index += 1;
                }
            }
        }

        Ok(())
    }

    /// Index paths of every node, roots first, then descendants level by
    /// level.
    fn breadth_first_paths(&self) -> Vec<Vec<usize>> {
        let mut paths = Vec::new();
        let mut queue: VecDeque<Vec<usize>> = (0..self.hierarchy.len()).map(|i| vec![i]).collect();

        while let Some(path) = queue.pop_front() {
            let node = self.node_at(&path);
            for child_index in 0..node.children.len() {
                let mut child_path = path.clone();
                child_path.push(child_index);
                queue.push_back(child_path);
            }

            paths.push(path);
        }

        paths
    }

    fn node_at(&self, path: &[usize]) -> &X509Node {
        let mut node = &self.hierarchy[path[0]];
        for &index in &path[1..] {
            node = &node.children[index];
        }
        node
    }

    fn node_at_mut(&mut self, path: &[usize]) -> &mut X509Node {
        let mut node = &mut self.hierarchy[path[0]];
        for &index in &path[1..] {
            node = &mut node.children[index];
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_leaf, generate_root, TestCa};
    use crate::types::EncodingFormat;

    fn cert(ca: &TestCa) -> Certificate {
        Certificate::from_data(ca.pem().as_bytes(), EncodingFormat::Pem).expect("parse")
    }

    fn three_tier() -> (TestCa, TestCa, TestCa) {
        let root = generate_root("Root CA", -3600, 86400 * 365);
        let subca = root.issue_intermediate("Sub CA", -3600, 86400 * 180);
        let leaf = generate_leaf(&subca, "Leaf", -3600, 86400 * 30);
        (root, subca, leaf)
    }

    #[test]
    fn builds_a_linked_chain() {
        let (root, subca, leaf) = three_tier();
        let hierarchy = CertificateHierarchy::build_hierarchy(vec![
            cert(&root),
            cert(&subca),
            cert(&leaf),
        ])
        .expect("build");

        assert_eq!(hierarchy.roots().len(), 1);
        let root_node = &hierarchy.roots()[0];
        assert!(root_node.state.is_self_signed);
        assert_eq!(root_node.children.len(), 1);
        assert_eq!(root_node.children[0].children.len(), 1);

        let descendants = hierarchy.collect_descendants(&cert(&root));
        assert_eq!(descendants, vec![cert(&subca), cert(&leaf)]);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let (root, subca, leaf) = three_tier();
        let certificates = [cert(&root), cert(&subca), cert(&leaf)];

        let permutations: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for permutation in permutations {
            let input: Vec<Certificate> = permutation
                .iter()
                .map(|&i| certificates[i].clone())
                .collect();
            let hierarchy = CertificateHierarchy::build_hierarchy(input).expect("build");

            assert_eq!(hierarchy.roots().len(), 1, "order {permutation:?}");
            let root_node = &hierarchy.roots()[0];
            assert_eq!(root_node.certificate, certificates[0]);
            assert_eq!(root_node.children.len(), 1);
            assert_eq!(root_node.children[0].certificate, certificates[1]);
            assert_eq!(root_node.children[0].children[0].certificate, certificates[2]);
        }
    }

    #[test]
    fn every_non_root_points_at_its_issuer() {
        let (root, subca, leaf) = three_tier();
        let hierarchy = CertificateHierarchy::build_hierarchy(vec![
            cert(&leaf),
            cert(&root),
            cert(&subca),
        ])
        .expect("build");

        hierarchy.for_each(|node| {
            if !node.state.is_self_signed {
                assert!(node.certificate.is_child(&node.issuer));
            } else {
                assert_eq!(node.certificate, node.issuer);
            }
            true
        });
    }

    #[test]
    fn missing_issuer_makes_a_permanent_orphan() {
        let (root, subca, leaf) = three_tier();
        let other_root = generate_root("Unrelated Root", -3600, 86400);

        // The sub CA is absent, so the leaf cannot be linked
        let hierarchy = CertificateHierarchy::build_hierarchy(vec![
            cert(&root),
            cert(&leaf),
            cert(&other_root),
        ])
        .expect("build");

        assert_eq!(hierarchy.roots().len(), 3);
        let orphan = hierarchy
            .roots()
            .iter()
            .find(|node| node.certificate == cert(&leaf))
            .expect("orphan node");
        assert!(orphan.state.is_permanent_orphan);
        assert!(orphan.hash.is_none());
        let _ = subca;
    }

    #[test]
    fn self_signed_is_never_a_child() {
        let (root, subca, leaf) = three_tier();
        let second_root = generate_root("Second Root", -3600, 86400);

        let hierarchy = CertificateHierarchy::build_hierarchy(vec![
            cert(&leaf),
            cert(&second_root),
            cert(&subca),
            cert(&root),
        ])
        .expect("build");

        hierarchy.for_each(|node| {
            if node.certificate.is_self_signed() {
                assert!(hierarchy
                    .roots()
                    .iter()
                    .any(|root| root.certificate == node.certificate));
            }
            true
        });
    }

    #[test]
    fn hash_queries_resolve_through_the_issuer() {
        let (root, subca, leaf) = three_tier();
        let hierarchy = CertificateHierarchy::build_hierarchy(vec![
            cert(&root),
            cert(&subca),
            cert(&leaf),
        ])
        .expect("build");

        let leaf_cert = cert(&leaf);
        let subca_cert = cert(&subca);

        let leaf_hash = hierarchy.get_certificate_hash(&leaf_cert).expect("hash");
        assert_eq!(leaf_hash.issuer_key_hash, subca_cert.key_hash().unwrap());

        assert!(hierarchy.contains_certificate_hash(&leaf_hash, false));
        assert_eq!(
            hierarchy.find_certificate(&leaf_hash, false),
            Some(leaf_cert.clone())
        );
        assert_eq!(hierarchy.find_certificates_multi(&leaf_hash), vec![leaf_cert.clone()]);

        // Case-insensitive match for externally supplied casing
        let mut upper = leaf_hash.clone();
        upper.issuer_name_hash = upper.issuer_name_hash.to_uppercase();
        assert!(!hierarchy.contains_certificate_hash(&upper, false));
        assert!(hierarchy.contains_certificate_hash(&upper, true));

        assert_eq!(
            hierarchy.find_certificate_root(&leaf_cert),
            Some(cert(&root))
        );
    }

    #[test]
    fn hash_of_unlinked_certificate_fails() {
        let (root, _subca, leaf) = three_tier();
        let hierarchy =
            CertificateHierarchy::build_hierarchy(vec![cert(&root), cert(&leaf)]).expect("build");

        let result = hierarchy.get_certificate_hash(&cert(&leaf));
        assert!(matches!(result, Err(Error::NoCertificateFound(_))));
    }

    #[test]
    fn duplicate_intermediates_produce_multiple_matches() {
        let (root, subca, leaf) = three_tier();

        // The same sub CA can reside in two bundles at once
        let hierarchy = CertificateHierarchy::build_hierarchy(vec![
            cert(&root),
            cert(&subca),
            cert(&subca),
            cert(&leaf),
        ])
        .expect("build");

        let subca_hash = hierarchy.get_certificate_hash(&cert(&subca)).expect("hash");
        assert_eq!(hierarchy.find_certificates_multi(&subca_hash).len(), 2);
    }

    #[test]
    fn lone_orphan_is_not_marked_permanent() {
        let (_root, _subca, leaf) = three_tier();
        let hierarchy =
            CertificateHierarchy::build_hierarchy(vec![cert(&leaf)]).expect("build");

        // A single-entry forest skips pruning entirely
        assert_eq!(hierarchy.roots().len(), 1);
        assert!(!hierarchy.roots()[0].state.is_permanent_orphan);
        assert!(hierarchy.roots()[0].hash.is_none());
    }
}
