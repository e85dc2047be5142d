//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use arango_core::crd::ArangoDeployment;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("manifests").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating {:?}", &crds_path))?;

    let deployment = ArangoDeployment::crd();
    let deployment_yaml = serde_yaml::to_string(&deployment).context("error serializing ArangoDeployment CRD to yaml")?;
    std::fs::write(crds_path.join("deployment.yaml"), &deployment_yaml).with_context(|| format!("error writing ArangoDeployment CRD to {:?}", &crds_path))?;
    println!("ArangoDeployment CRD written to {:?}", &crds_path);

    Ok(())
}
