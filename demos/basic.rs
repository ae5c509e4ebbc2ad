use bytes::Bytes;
use hermes::{Actor, ActorError, Envelope, Runtime};

struct Greeter;

impl Actor for Greeter {
    fn receive(&mut self, envelope: Envelope) -> Result<(), ActorError> {
        println!("greeter got: {:?}", envelope.payload);
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let rt = Runtime::new();
    let pid = rt.spawn(Greeter);

    rt.send(pid, Bytes::from_static(b"hello from demo")).unwrap();

    // give the actor a moment to run
    std::thread::sleep(std::time::Duration::from_millis(50));

    rt.stop(pid).unwrap();
    rt.shutdown();
}
