//! # Manifest Generators
//!
//! A generator turns an extracted template source into a list of Kubernetes
//! objects for one component. The engine is detected by the presence of a
//! chart descriptor at the source root: `Chart.yaml` selects the Helm
//! engine, anything else the Kustomize engine. Both engines are consumed as
//! opaque template renderers (`helm template` / `kustomize build`); the
//! generator owns the extracted working directory for as long as it stays
//! cached.

pub mod assemble;
pub mod cache;

use crate::controller::artifact;
use crate::controller::decrypt::Decryptor;
use crate::controller::error::ReconcileError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kube::core::DynamicObject;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

pub type ValueMap = serde_json::Map<String, serde_json::Value>;

/// A ready-to-invoke manifest generator bound to one extracted source
/// snapshot.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        namespace: &str,
        name: &str,
        values: &ValueMap,
    ) -> Result<Vec<DynamicObject>, ReconcileError>;
}

/// Fetch and extract the artifact into a fresh working directory and bind
/// the matching engine to it. The returned generator keeps the directory
/// alive until it is evicted from the cache.
pub async fn build_generator(
    client: &reqwest::Client,
    artifact_url: &str,
    path: Option<&str>,
    decryptor: Option<Box<dyn Decryptor>>,
) -> Result<Arc<dyn Generator>, ReconcileError> {
    let workdir = TempDir::with_prefix("component-controller-")
        .context("failed to create generator working directory")
        .map_err(ReconcileError::Fatal)?;

    artifact::fetch(client, artifact_url, path, decryptor, workdir.path()).await?;

    let source_root = match path {
        Some(path) => workdir.path().join(path),
        None => workdir.path().to_path_buf(),
    };
    if !source_root.exists() {
        return Err(ReconcileError::fatal(format!(
            "no such file or directory: {}",
            path.unwrap_or(".")
        )));
    }
    if !source_root.is_dir() {
        return Err(ReconcileError::fatal(format!(
            "not a directory: {}",
            path.unwrap_or(".")
        )));
    }

    let generator: Arc<dyn Generator> = if source_root.join("Chart.yaml").is_file() {
        info!("detected Helm chart at {}", source_root.display());
        Arc::new(HelmGenerator::new(workdir, source_root))
    } else {
        info!("detected Kustomize overlay at {}", source_root.display());
        Arc::new(KustomizeGenerator::new(workdir, source_root))
    };
    Ok(generator)
}

/// Helm engine bound to a chart directory; renders with `helm template`.
pub struct HelmGenerator {
    // keeps the extracted source alive while cached
    _workdir: TempDir,
    chart_dir: PathBuf,
}

impl HelmGenerator {
    fn new(workdir: TempDir, chart_dir: PathBuf) -> Self {
        HelmGenerator { _workdir: workdir, chart_dir }
    }
}

#[async_trait]
impl Generator for HelmGenerator {
    async fn generate(
        &self,
        namespace: &str,
        name: &str,
        values: &ValueMap,
    ) -> Result<Vec<DynamicObject>, ReconcileError> {
        let helm = which::which("helm")
            .context("helm binary not found on PATH")
            .map_err(ReconcileError::Fatal)?;

        // helm accepts JSON values files
        let mut values_file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .context("failed to stage values file")
            .map_err(ReconcileError::Fatal)?;
        serde_json::to_writer(values_file.as_file_mut(), values)
            .context("failed to serialize values")
            .map_err(ReconcileError::Fatal)?;

        let output = tokio::process::Command::new(helm)
            .arg("template")
            .arg(name)
            .arg(&self.chart_dir)
            .arg("--namespace")
            .arg(namespace)
            .arg("--values")
            .arg(values_file.path())
            .output()
            .await
            .context("failed to execute helm template")
            .map_err(ReconcileError::Fatal)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReconcileError::fatal(format!(
                "helm template failed: {}",
                stderr.trim()
            )));
        }

        parse_manifests(&String::from_utf8_lossy(&output.stdout)).map_err(ReconcileError::Fatal)
    }
}

/// Kustomize engine bound to an overlay directory; renders with
/// `kustomize build`. Values do not apply to overlays and are ignored.
pub struct KustomizeGenerator {
    _workdir: TempDir,
    overlay_dir: PathBuf,
}

impl KustomizeGenerator {
    fn new(workdir: TempDir, overlay_dir: PathBuf) -> Self {
        KustomizeGenerator { _workdir: workdir, overlay_dir }
    }
}

#[async_trait]
impl Generator for KustomizeGenerator {
    async fn generate(
        &self,
        _namespace: &str,
        _name: &str,
        _values: &ValueMap,
    ) -> Result<Vec<DynamicObject>, ReconcileError> {
        let kustomize = which::which("kustomize")
            .context("kustomize binary not found on PATH")
            .map_err(ReconcileError::Fatal)?;

        let output = tokio::process::Command::new(kustomize)
            .arg("build")
            .arg(&self.overlay_dir)
            .output()
            .await
            .context("failed to execute kustomize build")
            .map_err(ReconcileError::Fatal)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReconcileError::fatal(format!(
                "kustomize build failed: {}",
                stderr.trim()
            )));
        }

        parse_manifests(&String::from_utf8_lossy(&output.stdout)).map_err(ReconcileError::Fatal)
    }
}

/// Parse a multi-document YAML manifest stream into dynamic objects,
/// skipping empty documents.
pub fn parse_manifests(manifests: &str) -> Result<Vec<DynamicObject>> {
    use serde::Deserialize;

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifests) {
        let value = serde_json::Value::deserialize(document)
            .context("failed to parse rendered manifest document")?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_json::from_value(value)
            .context("rendered manifest document is not a Kubernetes object")?;
        objects.push(object);
    }
    debug!("parsed {} rendered objects", objects.len());
    Ok(objects)
}

/// Engine detection without building: used by tests and diagnostics.
pub fn detect_engine(source_root: &Path) -> Result<&'static str> {
    if !source_root.is_dir() {
        bail!("not a directory: {}", source_root.display());
    }
    if source_root.join("Chart.yaml").is_file() {
        Ok("helm")
    } else {
        Ok("kustomize")
    }
}
