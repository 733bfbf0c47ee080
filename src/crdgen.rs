//! Prints the CustomResourceDefinition YAML for every CRD this operator
//! owns, for `kubectl apply -f <(crdgen)`.

use kube::CustomResourceExt;
use zen_watcher::types::{Ingester, Observation, ObservationMapping};

fn main() {
    for crd in [Observation::crd(), ObservationMapping::crd(), Ingester::crd()] {
        println!("{}", serde_yaml::to_string(&crd).expect("crd serializes to yaml"));
        println!("---");
    }
}
