use hibernator_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/hibernator.ardikabs.com_hibernateplans.yaml",
        serde_yaml::to_string(&HibernatePlan::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/hibernator.ardikabs.com_scheduleexceptions.yaml",
        serde_yaml::to_string(&ScheduleException::crd()).unwrap(),
    )
    .unwrap();
}
