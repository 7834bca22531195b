//! Shared test fixtures: an in-memory descriptor pool for a demo Greeter
//! service covering all four call shapes and every field kind the
//! marshalling layer handles.

use crate::descriptor::DescriptorRegistry;
use prost_reflect::DescriptorPool;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, MessageOptions, MethodDescriptorProto,
    OneofDescriptorProto, ServiceDescriptorProto,
};

fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        ..Default::default()
    }
}

fn typed_field(name: &str, number: i32, ty: Type, type_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        type_name: Some(type_name.to_string()),
        ..field(name, number, ty)
    }
}

fn repeated(mut f: FieldDescriptorProto) -> FieldDescriptorProto {
    f.label = Some(Label::Repeated as i32);
    f
}

fn oneof_member(mut f: FieldDescriptorProto, index: i32) -> FieldDescriptorProto {
    f.oneof_index = Some(index);
    f
}

fn method(name: &str, client_streaming: bool, server_streaming: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(".demo.HelloRequest".to_string()),
        output_type: Some(".demo.HelloReply".to_string()),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        ..Default::default()
    }
}

fn hello_request() -> DescriptorProto {
    let counts_entry = DescriptorProto {
        name: Some("CountsEntry".to_string()),
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        field: vec![field("key", 1, Type::String), field("value", 2, Type::Int32)],
        ..Default::default()
    };

    DescriptorProto {
        name: Some("HelloRequest".to_string()),
        field: vec![
            field("name", 1, Type::String),
            field("big", 2, Type::Int64),
            field("ubig", 3, Type::Uint64),
            field("blob", 4, Type::Bytes),
            typed_field("mood", 5, Type::Enum, ".demo.Mood"),
            typed_field("nested", 6, Type::Message, ".demo.Nested"),
            repeated(field("tags", 7, Type::String)),
            repeated(typed_field(
                "counts",
                8,
                Type::Message,
                ".demo.HelloRequest.CountsEntry",
            )),
            oneof_member(field("text", 9, Type::String), 0),
            oneof_member(field("raw", 10, Type::Bytes), 0),
            field("flag", 11, Type::Bool),
            field("score", 12, Type::Double),
        ],
        nested_type: vec![counts_entry],
        oneof_decl: vec![OneofDescriptorProto {
            name: Some("choice".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn demo_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("demo.proto".to_string()),
        package: Some("demo".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            hello_request(),
            DescriptorProto {
                name: Some("Nested".to_string()),
                field: vec![field("id", 1, Type::String)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("HelloReply".to_string()),
                field: vec![field("message", 1, Type::String)],
                ..Default::default()
            },
        ],
        enum_type: vec![EnumDescriptorProto {
            name: Some("Mood".to_string()),
            value: vec![
                EnumValueDescriptorProto {
                    name: Some("MOOD_UNSPECIFIED".to_string()),
                    number: Some(0),
                    ..Default::default()
                },
                EnumValueDescriptorProto {
                    name: Some("HAPPY".to_string()),
                    number: Some(1),
                    ..Default::default()
                },
                EnumValueDescriptorProto {
                    name: Some("GRUMPY".to_string()),
                    number: Some(2),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        service: vec![ServiceDescriptorProto {
            name: Some("Greeter".to_string()),
            method: vec![
                method("SayHello", false, false),
                method("GreetMany", false, true),
                method("AccumulateGreetings", true, false),
                method("Chat", true, true),
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub(crate) fn test_pool() -> DescriptorPool {
    DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
        file: vec![demo_file()],
    })
    .expect("demo descriptor set is valid")
}

pub(crate) fn test_registry() -> DescriptorRegistry {
    DescriptorRegistry::from(test_pool())
}
