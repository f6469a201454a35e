//! Prints the operator CRDs as multi-document YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds.yaml`

use crds::{Wireguard, WireguardPeer};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Wireguard::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&WireguardPeer::crd())?);
    Ok(())
}
