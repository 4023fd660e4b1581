use super::*;

impl sansio::Protocol<SocketMessage, DataChannelMessage, ()> for TransportChannel {
    type Rout = DataChannelMessage;
    type Wout = SentPacket;
    type Eout = TransportChannelEvent;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: SocketMessage) -> std::result::Result<(), Self::Error> {
        self.context.assert_current();
        let now = msg.now;
        self.last_now = now;
        if self.closed {
            trace!(
                "[{}]: discarding {:?} from {} after close",
                self.name, msg.event, msg.socket_id
            );
            return Ok(());
        }
        let Some(port) = self.port.as_mut() else {
            warn!(
                "[{}]: discarding {:?} from {}, gathering not started",
                self.name, msg.event, msg.socket_id
            );
            return Ok(());
        };
        port.handle_socket_message(msg);
        self.process_port_events(now);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.reads.pop_front()
    }

    /// Sends at the time of the last read or timeout.
    fn handle_write(&mut self, msg: DataChannelMessage) -> std::result::Result<(), Self::Error> {
        let now = self.last_now;
        self.send_data(msg.channel_id, &msg.params, &msg.payload, now)?;
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.writes.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> std::result::Result<(), Self::Error> {
        self.context.assert_current();
        self.last_now = now;
        if self.closed {
            return Ok(());
        }
        if let Some(port) = self.port.as_mut() {
            port.handle_timeout(now);
        }
        if let Some(engine) = self.handshake.as_mut() {
            if let Err(err) = engine.handle_timeout(now) {
                warn!("[{}]: handshake timeout failed: {}", self.name, err);
            }
            self.flush_handshake(now);
        }
        self.process_port_events(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        if self.closed {
            return None;
        }
        let port = self.port.as_ref().and_then(|port| port.poll_timeout());
        let engine = self
            .handshake
            .as_ref()
            .and_then(|engine| engine.poll_timeout());
        match (port, engine) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn close(&mut self) -> std::result::Result<(), Self::Error> {
        self.shutdown()
    }
}
