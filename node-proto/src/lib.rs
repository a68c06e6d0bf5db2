//! Generated gRPC types and service stubs for the node control plane.

tonic::include_proto!("node_control");
