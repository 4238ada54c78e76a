/// Client-side connection state the response path reads and updates
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Client username
    pub username: String,
    /// Current database
    pub database: Option<String>,
    /// Client address
    pub host: String,
    pub port: u16,
    /// Client autocommit mode
    pub autocommit: bool,
    /// Explicit transaction opened by the client
    pub tx_started: bool,
    /// Client capability flags
    pub capability_flags: u32,
    /// Character set
    pub character_set: u8,
    /// Error that broke the current transaction, if any
    pub tx_interrupt: Option<String>,
    pub last_insert_id: u64,
}

impl ClientState {
    pub fn new(username: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            username: username.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Update state after parsing handshake response
    pub fn set_from_handshake(&mut self, username: String, database: Option<String>, capabilities: u32, charset: u8) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }

    /// Start a transaction
    pub fn begin_transaction(&mut self) {
        self.tx_started = true;
        self.tx_interrupt = None;
    }

    /// End a transaction
    pub fn end_transaction(&mut self) {
        self.tx_started = false;
        self.tx_interrupt = None;
    }

    /// Whether statements commit on their own: autocommit on and no
    /// explicit transaction open
    pub fn effective_autocommit(&self) -> bool {
        self.autocommit && !self.tx_started
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            username: String::new(),
            database: None,
            host: String::new(),
            port: 0,
            autocommit: true,
            tx_started: false,
            capability_flags: crate::protocol::capabilities::DEFAULT_CAPABILITIES,
            character_set: 33,
            tx_interrupt: None,
            last_insert_id: 0,
        }
    }
}
