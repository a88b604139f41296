use tandem::NetConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    /// How often the local avatar's position is sent, in Hz.
    pub position_send_rate: u32,
    pub net: NetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::from("player"),
            position_send_rate: 20,
            net: NetConfig::default(),
        }
    }
}
