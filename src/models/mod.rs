pub mod gru;
