pub mod generated {
    pub mod mds_balancer {
        include!("./generated/mds_balancer.rs");
    }
}
