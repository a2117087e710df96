//! # Component Controller
//!
//! A Kubernetes controller that reconciles `Component` resources: versioned
//! template archives (Helm charts or Kustomize overlays) resolved from HTTP
//! repositories or flux sources, optionally SOPS-decrypted, rendered with
//! merged values and post-build variable substitution, and applied to the
//! cluster in dependency order.
//!
//! ## Overview
//!
//! 1. **Source resolution** - HTTP HEAD probing or flux source lookup yields
//!    a content-identified artifact
//! 2. **Artifact fetching** - gzip/tar archives are downloaded and safely
//!    extracted, with per-file SOPS decryption as configured
//! 3. **Generator cache** - rendered working directories are cached by
//!    content fingerprint with a sliding validity window
//! 4. **Manifest assembly** - deep-merged values drive `helm template` or
//!    `kustomize build`; `${VAR}` placeholders are substituted afterwards
//! 5. **Dependency gating** - components wait for their declared
//!    dependencies before applying, and deletion is blocked while dependents
//!    remain

pub mod controller;
pub mod crd;
