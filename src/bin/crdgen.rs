use kube::CustomResourceExt;
use machine_api_operator::crd::{Machine, MachineHealthCheck, MachineSet};

fn main() -> Result<(), serde_yaml::Error> {
    for crd in [Machine::crd(), MachineSet::crd(), MachineHealthCheck::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
