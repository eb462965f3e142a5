// tapcast-common: wire types shared by the relay and overlay clients

pub mod protocol;
pub mod tenant;
