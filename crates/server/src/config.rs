use tandem::NetConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub server_name: String,
    pub net: NetConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: String::from("0.0.0.0"),
            server_name: String::from("Server"),
            net: NetConfig::default(),
        }
    }
}
