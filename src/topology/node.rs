use std::fmt::{Debug, Formatter};

/// A cluster node as configured. Nodes are identified by their name; host and port are the
///  transport endpoint the node listens on.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Node {
    name: String,
    host: String,
    port: u16,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}:{}]", self.name, self.host, self.port)
    }
}

impl Node {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Node {
        Node {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug() {
        let node = Node::new("R1", "10.0.0.1", 9000);
        assert_eq!(format!("{:?}", node), "[R1@10.0.0.1:9000]");
    }
}
