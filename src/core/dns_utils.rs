/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared DNS-level helpers used across plugins and the server handler.

use hickory_proto::op::{Message, MessageType, ResponseCode};

/// Build a minimal DNS response from request, preserving id/opcode/query.
pub fn build_response_from_request(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_op_code(request.op_code());
    response.set_message_type(MessageType::Response);
    response.set_response_code(rcode);
    response.set_recursion_desired(request.recursion_desired());
    *response.queries_mut() = request.queries().to_vec();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};

    #[test]
    fn reply_preserves_id_and_question() {
        let mut request = Message::new();
        request.set_id(777);
        request.add_query(Query::query(
            Name::from_ascii("example.org.").unwrap(),
            RecordType::AAAA,
        ));

        let reply = build_response_from_request(&request, ResponseCode::Refused);
        assert_eq!(reply.id(), 777);
        assert_eq!(reply.response_code(), ResponseCode::Refused);
        assert_eq!(reply.queries(), request.queries());
        assert_eq!(reply.message_type(), MessageType::Response);
    }
}
