// Route modules for Parley Server
pub mod health; // Liveness and connection count
pub mod websocket; // Chat over WebSocket
