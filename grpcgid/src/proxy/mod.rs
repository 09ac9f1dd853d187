mod acceptor;
mod stream;
mod transport;

pub use acceptor::serve;
