pub mod app;
pub mod config;
pub mod error;
pub mod state;

pub mod crypto {
    pub mod session_token;
}

pub mod models {
    pub mod history;
    pub mod identity;
    pub mod session;
}

pub mod repositories {
    pub mod history;
}

pub mod services {
    pub mod captioner;
    pub mod identity;
    pub mod session;
}

pub mod handlers {
    pub mod auth;
    pub mod generate;
    pub mod history;
    pub mod models;
}

pub mod middleware_layer {
    pub mod caller;
}

pub mod validation {
    pub mod history;
    pub mod image;
}
