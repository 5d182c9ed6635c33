/// Identifies one remote beacon node and the local ports tunnelled to its services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconNodePortMap {
    /// `(bastion host, bastion SSH port)` of the node this port map belongs to.
    pub host_id: (String, u16),
    pub lighthouse_rpc: u16,
    pub prysm_http: u16,
    pub prysm_grpc: u16,
}
