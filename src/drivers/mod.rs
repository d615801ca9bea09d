// Hardware collaborators consumed by the network core
pub mod net;
